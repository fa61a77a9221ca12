//! Nice `mcgw` output formatting.

use std::fmt;

use log;

const MCGW_BANNER_LENGTH: usize = 103;

/// Logs a warning to the `mcgw-output` logger.
macro_rules! mcgw_warn {
    ($fmt:expr $(, $($arg:tt)*)?) => { log::warn!(target: "mcgw-output", $fmt, $($($arg)*)?); }
}

/// Logs a main output line to the `mcgw-output` logger.
macro_rules! mcgw_output {
    ($fmt:expr $(, $($arg:tt)*)?) => { log::info!(target: "mcgw-output", $fmt, $($($arg)*)?); }
}

pub(crate) use {mcgw_output, mcgw_warn};

/// Logs a nicely formatted section title to the `mcgw-output` logger.
pub(crate) fn log_title(title: &str) {
    let length = title.chars().count().max(MCGW_BANNER_LENGTH - 6);
    let bar = "─".repeat(length);
    mcgw_output!("┌──{bar}──┐");
    mcgw_output!("│§ {title:^length$} §│");
    mcgw_output!("└──{bar}──┘");
}

/// Writes a nicely formatted subtitle.
pub(crate) fn write_subtitle(f: &mut fmt::Formatter<'_>, subtitle: &str) -> fmt::Result {
    let length = subtitle.chars().count();
    let bar = "═".repeat(length);
    writeln!(f, "{subtitle}")?;
    writeln!(f, "{bar}")?;
    Ok(())
}

/// Logs a nicely formatted subtitle to the `mcgw-output` logger.
pub(crate) fn log_subtitle(subtitle: &str) {
    let length = subtitle.chars().count();
    let bar = "═".repeat(length);
    mcgw_output!("{}", subtitle);
    mcgw_output!("{}", bar);
}

/// Turns a boolean into a string of `yes` or `no`.
pub(crate) fn nice_bool(b: bool) -> String {
    if b {
        "yes".to_string()
    } else {
        "no".to_string()
    }
}

/// A trait for logging `mcgw` outputs nicely.
pub(crate) trait McGwOutput: fmt::Debug + fmt::Display {
    /// Logs display output nicely.
    fn log_output_display(&self) {
        let lines = self.to_string();
        lines.lines().for_each(|line| {
            mcgw_output!("{line}");
        })
    }

    /// Logs debug output nicely.
    fn log_output_debug(&self) {
        let lines = format!("{self:?}");
        lines.lines().for_each(|line| {
            mcgw_output!("{line}");
        })
    }
}

// Blanket implementation
impl<T> McGwOutput for T where T: fmt::Debug + fmt::Display {}
