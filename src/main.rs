use std::process;

fn main() {
    if let Err(err) = keepsake::cli::run() {
        eprintln!("error: {err:#}");
        process::exit(1);
    }
}
