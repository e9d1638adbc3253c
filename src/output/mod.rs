//! Console output control with structured log levels
//!
//! [`OutputManager`] is created once by the caller and handed to every component
//! that reports progress; nothing in the crate logs through a global.

use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub struct OutputManager {
    pub verbose: bool,
    quiet: bool,
    component: Option<&'static str>,
    start_time: Option<Instant>,
}

impl OutputManager {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            quiet: false,
            component: None,
            start_time: Some(Instant::now()),
        }
    }

    pub fn new_quiet() -> Self {
        Self {
            verbose: false,
            quiet: true,
            component: None,
            start_time: Some(Instant::now()),
        }
    }

    /// Same sink and settings, tagged with the component name in verbose mode.
    pub fn scoped(&self, component: &'static str) -> Self {
        Self {
            component: Some(component),
            ..self.clone()
        }
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    pub fn trace(&self, message: &str) {
        if self.verbose {
            self.print_with_timestamp("TRACE", message, "🔍");
        }
    }

    pub fn debug(&self, message: &str) {
        if self.verbose {
            self.print_with_timestamp("DEBUG", message, "🐛");
        }
    }

    pub fn verbose(&self, message: &str) {
        if self.verbose {
            self.print_with_timestamp("INFO", message, "ℹ️");
        }
    }

    pub fn info(&self, message: &str) {
        if !self.quiet {
            self.print_with_timestamp("INFO", message, "ℹ️");
        }
    }

    pub fn success(&self, message: &str) {
        if !self.quiet {
            self.print_with_timestamp("SUCCESS", message, "✅");
        }
    }

    pub fn warning(&self, message: &str) {
        self.print_with_timestamp("WARN", message, "⚠️");
    }

    pub fn error(&self, message: &str) {
        self.print_with_timestamp("ERROR", message, "❌");
    }

    /// Debug line followed by `key: value` pairs.
    pub fn fields(&self, message: &str, fields: &[(&str, String)]) {
        if !self.verbose {
            return;
        }
        let rendered: Vec<String> = fields
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        self.print_with_timestamp("DEBUG", &format!("{} {}", message, rendered.join(" ")), "🐛");
    }

    pub fn section(&self, title: &str) {
        if self.quiet {
            return;
        }

        if self.verbose {
            let separator = "━".repeat(60);
            println!("\n{}", separator);
            println!("📋 {}", title);
            println!("{}", separator);
        } else {
            println!("\n📋 {}", title);
        }
    }

    pub fn subsection(&self, title: &str) {
        if self.verbose {
            println!("  📂 {}", title);
        }
    }

    pub fn step(&self, step: &str) {
        if self.verbose {
            println!("    🔸 {}", step);
        }
    }

    pub fn detail(&self, detail: &str) {
        if self.verbose {
            println!("      📝 {}", detail);
        }
    }

    fn print_with_timestamp(&self, level: &str, message: &str, emoji: &str) {
        if self.verbose {
            let timestamp = match self.start_time {
                Some(start_time) => format!("[{:8.3}s]", start_time.elapsed().as_secs_f64()),
                None => String::new(),
            };
            match self.component {
                Some(component) => {
                    println!("{} {} {} [{}] {}", timestamp, emoji, level, component, message)
                }
                None => println!("{} {} {} {}", timestamp, emoji, level, message),
            }
        } else if level == "ERROR" || level == "WARN" {
            eprintln!("{} {}", emoji, message);
        } else {
            println!("{} {}", emoji, message);
        }
    }

    pub fn format_size(&self, size: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = size as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        if unit_index == 0 {
            format!("{} {}", size as u64, UNITS[unit_index])
        } else {
            format!("{:.1} {}", size, UNITS[unit_index])
        }
    }

    pub fn format_duration(&self, duration: Duration) -> String {
        let secs = duration.as_secs();
        if secs < 60 {
            format!("{:.1}s", duration.as_secs_f64())
        } else if secs < 3600 {
            format!("{}m{:02}s", secs / 60, secs % 60)
        } else {
            format!("{}h{:02}m{:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
        }
    }

    pub fn summary(&self, title: &str, items: &[(&str, String)]) {
        if self.quiet {
            return;
        }

        println!("\n📊 {}", title);
        for (key, value) in items {
            println!("  • {}: {}", key, value);
        }
    }
}
