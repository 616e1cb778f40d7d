//! Terminal output for the `trek` commands.
//!
//! Status lines go to stdout until [`reserve_stdout_for_sql`] is called.
//! After that they move to stderr and stdout only carries what [`raw`]
//! prints, so `trek generate --stdout > change.sql` yields plain SQL.
//! Prompts always go to stderr.

use std::fmt::Display;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use owo_colors::OwoColorize;

static STATUS_ON_STDERR: AtomicBool = AtomicBool::new(false);

/// Width of the key column printed by [`kv`].
const KEY_WIDTH: usize = 12;

/// Send status lines to stderr from now on.
pub fn reserve_stdout_for_sql() {
    STATUS_ON_STDERR.store(true, Ordering::Relaxed);
}

fn status(line: impl Display) {
    if STATUS_ON_STDERR.load(Ordering::Relaxed) {
        eprintln!("{}", line);
    } else {
        println!("{}", line);
    }
}

/// Title of a command run
pub fn header(text: &str) {
    status("");
    status(format_args!("{} {}", "trek".bold().magenta(), text.bold()));
    status("");
}

/// Banner shown by `trek version`
pub fn logo() {
    let logo = r"
  _            _
 | |_ _ _ ___ | |__
 |  _| '_/ -_)| / /
  \__|_| \___||_\_\
";
    status(logo.magenta().bold());
    status(format_args!(
        " {}",
        "forward-only migrations from a schema model".dimmed()
    ));
}

/// Heading of a group of lines
pub fn section(text: &str) {
    status(format_args!("{}", text.underline()));
}

/// Aligned key and value
pub fn kv(key: &str, value: &str) {
    status(format_args!(
        "  {} {}",
        format!("{:<width$}", key, width = KEY_WIDTH).dimmed(),
        value
    ));
}

/// Outcome of a command that succeeded
pub fn success(text: &str) {
    status(format_args!("{} {}", "✓".green().bold(), text));
}

/// Neutral notice
pub fn info(text: &str) {
    status(format_args!("{} {}", "·".blue().bold(), text));
}

/// Something the user should look at
pub fn warn(text: &str) {
    status(format_args!("{} {}", "!".yellow().bold(), text.yellow()));
}

/// Failure, always on stderr
pub fn error(text: &str) {
    eprintln!("{} {}", "error:".red().bold(), text);
}

/// Progress through a fixed number of steps
pub fn step(current: usize, total: usize, text: &str) {
    status(format_args!(
        "{} {}",
        format!("{:>2}/{}", current, total).dimmed(),
        text
    ));
}

/// Indented bullet
pub fn list_item(text: &str) {
    status(format_args!("  {} {}", "-".dimmed(), text));
}

/// Blank status line
pub fn newline() {
    status("");
}

/// Blank line on stderr
pub fn newline_err() {
    eprintln!();
}

/// Low-key hint
pub fn dim(text: &str) {
    status(text.dimmed());
}

/// Generated SQL, verbatim on stdout
pub fn raw(text: &str) {
    let mut stdout = io::stdout().lock();
    let _ = stdout.write_all(text.as_bytes());
    let _ = stdout.flush();
}

/// Read one trimmed answer after showing `prompt` on stderr.
fn answer(prompt: impl Display) -> Option<String> {
    eprint!("{} ", prompt);
    io::stderr().flush().ok();

    let mut line = String::new();
    io::stdin().read_line(&mut line).ok()?;
    let line = line.trim();
    (!line.is_empty()).then(|| line.to_string())
}

/// Yes/no question, no by default
pub fn confirm(prompt: &str) -> bool {
    answer(format_args!("{} {}", prompt, "[y/N]".dimmed()))
        .is_some_and(|a| matches!(a.to_lowercase().as_str(), "y" | "yes"))
}

/// Free-form question; `None` when left empty
pub fn input(prompt: &str) -> Option<String> {
    answer(format_args!("{}:", prompt))
}
