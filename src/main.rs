use vmsh::Interpreter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() {
    env_logger::init();

    println!("vmsh v{}: a shell for single-address-space program images", VERSION);
    let mut interpreter = Interpreter::default();
    let _ = interpreter.run("help", &[]);
    println!();

    match interpreter.repl() {
        Ok(status) => std::process::exit(status),
        Err(e) => {
            eprintln!("vmsh: {:#}", e);
            std::process::exit(1);
        }
    }
}
