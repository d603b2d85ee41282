fn main() {
    env_logger::init();

    if let Err(err) = lseq::app::run() {
        eprintln!("terminating with an error: {err:#}");
        std::process::exit(1);
    }
}
