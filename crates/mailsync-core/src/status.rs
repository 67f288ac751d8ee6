//! Colored status lines for the pane a process runs in.

use std::io::Write;

use crossterm::style::{Color, Stylize};

use crate::log::log_debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Connect,
    Event,
    Sync,
    PostSync,
    Finished,
    Notice,
    Error,
}

impl Tone {
    fn color(self) -> Color {
        match self {
            Tone::Connect | Tone::Event => Color::Green,
            Tone::Sync => Color::Cyan,
            Tone::PostSync => Color::Yellow,
            Tone::Finished => Color::Blue,
            Tone::Notice => Color::Magenta,
            Tone::Error => Color::Red,
        }
    }
}

pub fn line(tone: Tone, msg: &str) {
    log_debug(msg);
    let ts = chrono::Local::now().format("%H:%M:%S").to_string();
    println!("{} {}", ts.dark_grey(), msg.with(tone.color()).bold());
}

/// Overwrites the current terminal line with the seconds left.
pub fn countdown(remaining: u64) {
    let mut out = std::io::stdout();
    let _ = write!(out, "{} \r", remaining);
    let _ = out.flush();
}
