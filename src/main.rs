use colored::Colorize;

fn main() {
    if let Err(e) = charter::run() {
        eprintln!(
            "{} [{}/{}] {}",
            "error:".bright_red().bold(),
            e.category(),
            e.code().bright_yellow(),
            e
        );
        std::process::exit(1);
    }
}
