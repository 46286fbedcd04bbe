use nx2elf::driver::Driver;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let mut driver = Driver::new();

    match driver.parse_cli_args(&args) {
        Ok(true) => return,
        Ok(false) => {}
        Err(e) => {
            eprintln!("nx2elf: error: {}", e);
            std::process::exit(1);
        }
    }

    if let Err(e) = driver.run() {
        eprintln!("nx2elf: error: {}", e);
        std::process::exit(1);
    }
}
