use log::error;
use std::panic;

pub fn initialize_panic_handler() {
    better_panic::install();

    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        // The log file may be the only trace left by a panic on a worker thread
        let thread = std::thread::current();
        error!(
            "panic on thread {}: {panic_info}",
            thread.name().unwrap_or("<unnamed>")
        );
        log::logger().flush();

        default_hook(panic_info);
    }));
}
