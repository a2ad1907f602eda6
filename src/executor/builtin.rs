//! Task bodies shipped with the executor binary

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sha2::{Digest, Sha256};

use super::task::{TaskBody, TaskCatalog, TaskContext};

/// Returns its input unchanged
pub struct EchoTask;

impl TaskBody for EchoTask {
    fn run(&self, ctx: &TaskContext, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        ctx.check_killed()?;
        Ok(input.to_vec())
    }
}

/// Sleeps for the number of milliseconds given as input
pub struct SleepTask;

impl TaskBody for SleepTask {
    fn run(&self, ctx: &TaskContext, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        let text = std::str::from_utf8(input).context("sleep input is not UTF-8")?;
        let millis: u64 = text
            .trim()
            .parse()
            .with_context(|| format!("invalid sleep duration '{}'", text.trim()))?;

        // Sleep in slices so a kill without interruption is still observed
        let slice = Duration::from_millis(50);
        let mut remaining = Duration::from_millis(millis);
        while !remaining.is_zero() {
            ctx.check_killed()?;
            let step = remaining.min(slice);
            ctx.sleep(step)?;
            remaining -= step;
        }

        Ok(millis.to_string().into_bytes())
    }
}

/// SHA-256 of the input, hex encoded
pub struct ChecksumTask;

impl TaskBody for ChecksumTask {
    fn run(&self, ctx: &TaskContext, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut hasher = Sha256::new();
        for chunk in input.chunks(1 << 20) {
            ctx.check_killed()?;
            hasher.update(chunk);
        }
        Ok(hex::encode(hasher.finalize()).into_bytes())
    }
}

/// Counts whitespace separated words
pub struct WordCountTask;

impl TaskBody for WordCountTask {
    fn run(&self, ctx: &TaskContext, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        let text = std::str::from_utf8(input).context("word_count input is not UTF-8")?;

        let _buffer = ctx.memory().track(input.len() as u64);
        let words = text.split_whitespace().count() as i64;
        ctx.add_counter("words", words);

        Ok(words.to_string().into_bytes())
    }
}

/// Catalog with every built-in body registered
pub fn builtin_catalog() -> TaskCatalog {
    let mut catalog = TaskCatalog::new();
    catalog.register("echo", Arc::new(EchoTask));
    catalog.register("sleep", Arc::new(SleepTask));
    catalog.register("checksum", Arc::new(ChecksumTask));
    catalog.register("word_count", Arc::new(WordCountTask));
    catalog
}
