use log::info;

/// User-facing feedback: blocking alerts and transient toasts.
pub trait Notifier: Send + Sync {
    fn alert(&self, title: &str, message: &str);
    fn toast(&self, message: &str);
}

/// Writes notifications to stderr so stdout stays machine-readable.
pub struct TerminalNotifier {
    quiet: bool,
}

impl TerminalNotifier {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl Notifier for TerminalNotifier {
    fn alert(&self, title: &str, message: &str) {
        info!("alert: {title}: {message}");
        if !self.quiet {
            eprintln!("{title}\n  {message}");
        }
    }

    fn toast(&self, message: &str) {
        info!("toast: {message}");
        if !self.quiet {
            eprintln!("{message}");
        }
    }
}
