//! Output formatting utilities for the CLI
//!
//! Colored status-line helpers plus human-readable rendering of engine
//! state pushes.

use tw_core::ipc::StatusMessage;

/// Render a status push as a one-line human summary
pub fn describe_status(status: &StatusMessage) -> String {
    match status {
        StatusMessage::Connecting {
            country: Some(cc), ..
        } => format!("connecting to the best host in {cc}..."),
        StatusMessage::Connecting {
            host: Some(id), ..
        } => format!("connecting to {id}..."),
        StatusMessage::Connecting { .. } => "connecting...".to_string(),
        StatusMessage::Connected { host, address } => {
            format!("connected to {host} ({address})")
        }
        StatusMessage::Disconnecting => "disconnecting...".to_string(),
        StatusMessage::Disconnected => "disconnected".to_string(),
        StatusMessage::Error { message } => format!("error: {message}"),
    }
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red to stderr
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow to stderr
pub fn print_warning(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an informational message in cyan
pub fn print_info(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}
