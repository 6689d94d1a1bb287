use crate::error::{ErrorContext, KeylockError};
use std::fmt::Write;
use std::io::IsTerminal;

pub fn format_error_chain(error: &KeylockError) -> String {
    format_error_with_color(error, std::io::stderr().is_terminal())
}

/// ANSI styling that collapses to plain text when color is off.
struct Palette(bool);

impl Palette {
    fn paint(&self, sgr: &str, text: &str) -> String {
        if self.0 {
            format!("\x1b[{sgr}m{text}\x1b[0m")
        } else {
            text.to_string()
        }
    }
}

/// Renders the error, its details and one bullet per suggestion line.
pub fn format_error_with_color(error: &KeylockError, use_color: bool) -> String {
    let palette = Palette(use_color);
    let context = ErrorContext::new(error);
    let mut output = String::new();

    let _ = writeln!(output, "{} {error}", palette.paint("1;31", "Error:"));

    if let Some(details) = context.details.as_deref() {
        let _ = write!(output, "\n{details}\n");
    }

    if let Some(suggestion) = context.suggestion.as_deref() {
        let _ = write!(output, "\n{}\n", palette.paint("1;33", "Suggestions:"));
        for line in suggestion.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let _ = writeln!(output, "{}", palette.paint("36", &format!("• {line}")));
        }
    }

    output
}
