// file: src/chat/console.rs
// description: terminal notification sink for the local fetch and auth commands
// reference: uses indicatif for progress bars and colored for status lines

use crate::chat::{MessageRef, NotificationSink};
use crate::error::Result;
use crate::models::RequesterId;
use crate::utils::logging::{format_info, format_success};
use async_trait::async_trait;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

lazy_static! {
    static ref PROGRESS_TEXT: Regex = Regex::new(r"^(?:⏬|⏫) .*?(\d+(?:\.\d+)?)%")
        .expect("PROGRESS_TEXT regex is valid");
}

/// Console requester used by the local commands.
pub const CONSOLE_REQUESTER: RequesterId = 0;

pub struct ConsoleSink {
    colored: bool,
    next_ref: AtomicI64,
    active: Mutex<Option<(MessageRef, ProgressBar)>>,
}

impl ConsoleSink {
    pub fn new(colored: bool) -> Self {
        Self {
            colored,
            next_ref: AtomicI64::new(1),
            active: Mutex::new(None),
        }
    }

    fn allocate_ref(&self) -> MessageRef {
        self.next_ref.fetch_add(1, Ordering::SeqCst)
    }

    fn progress_percent(text: &str) -> Option<f64> {
        PROGRESS_TEXT
            .captures(text)
            .and_then(|caps| caps[1].parse::<f64>().ok())
    }

    fn start_bar(&self, message: MessageRef, text: &str, percent: f64) {
        let bar = create_progress_bar(self.colored);
        bar.set_position((percent * 10.0) as u64);
        bar.set_message(text.to_string());

        if let Ok(mut active) = self.active.lock() {
            if let Some((_, previous)) = active.replace((message, bar)) {
                previous.finish_and_clear();
            }
        }
    }

    fn finish_bar(&self) {
        if let Ok(mut active) = self.active.lock() {
            if let Some((_, bar)) = active.take() {
                bar.finish_and_clear();
            }
        }
    }

    fn print_line(&self, text: &str) {
        self.finish_bar();
        if self.colored {
            println!("{}", format_info(text));
        } else {
            println!("{}", text);
        }
    }
}

#[async_trait]
impl NotificationSink for ConsoleSink {
    async fn send_text(&self, _requester: RequesterId, text: &str) -> Result<MessageRef> {
        let message = self.allocate_ref();

        match Self::progress_percent(text) {
            Some(percent) => self.start_bar(message, text, percent),
            None => self.print_line(text),
        }

        Ok(message)
    }

    async fn edit_text(&self, _requester: RequesterId, message: MessageRef, text: &str) -> Result<()> {
        let percent = Self::progress_percent(text);

        if let Ok(active) = self.active.lock() {
            if let (Some((current, bar)), Some(percent)) = (active.as_ref(), percent) {
                if *current == message {
                    bar.set_position((percent * 10.0) as u64);
                    bar.set_message(text.to_string());
                    return Ok(());
                }
            }
        }

        match percent {
            Some(percent) => self.start_bar(message, text, percent),
            None => self.print_line(text),
        }
        Ok(())
    }

    async fn send_photo(
        &self,
        _requester: RequesterId,
        bytes: Vec<u8>,
        caption: &str,
    ) -> Result<MessageRef> {
        self.finish_bar();
        let line = format!("{} [thumbnail, {} KB]", caption, bytes.len() / 1024);
        if self.colored {
            println!("{}", format_success(&line));
        } else {
            println!("{}", line);
        }
        Ok(self.allocate_ref())
    }

    async fn send_video(
        &self,
        _requester: RequesterId,
        bytes: Vec<u8>,
        caption: &str,
    ) -> Result<MessageRef> {
        self.finish_bar();
        let size = format!("[video, {:.1} MB]", bytes.len() as f64 / 1_048_576.0);
        if self.colored {
            println!("{} {}", format_success(caption), size.dimmed());
        } else {
            println!("{} {}", caption, size);
        }
        Ok(self.allocate_ref())
    }
}

impl Drop for ConsoleSink {
    fn drop(&mut self) {
        self.finish_bar();
    }
}

/// Bar positions are tenths of a percent.
fn create_progress_bar(colored: bool) -> ProgressBar {
    let bar = ProgressBar::new(1000);
    let style = if colored {
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {msg}")
            .map(|s| s.progress_chars("█▓▒░"))
    } else {
        ProgressStyle::default_bar()
            .template("{spinner} [{elapsed_precise}] [{bar:40}] {msg}")
            .map(|s| s.progress_chars("=>-"))
    };

    if let Ok(style) = style {
        bar.set_style(style);
    }
    bar
}
