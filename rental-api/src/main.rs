fn main() {
    if let Err(err) = powerbank_rental::app::run() {
        eprintln!("api startup failed: {err}");
        std::process::exit(1);
    }
}
