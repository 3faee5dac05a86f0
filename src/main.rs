use colored::Colorize;

fn main() {
    let code = match exec_server::run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", format!("ERROR {e:#}").red());
            1
        }
    };
    std::process::exit(code);
}
