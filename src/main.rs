fn main() {
    let exit_code = match pipcore::run::run() {
        Ok(code) => code,
        Err(err) => {
            println!("pipcore: error: {}", err);
            1
        }
    };
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}
