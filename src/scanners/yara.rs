//! YARA rule matching.
//!
//! Rules are compiled once at startup from every regular file under the
//! configured directory, all in one namespace. Scanning feeds the file
//! through in bounded chunks; the match count accumulates across chunks.

use super::{ScanContext, SyncScanner};
use crate::entities::ScanResult;
use anyhow::{Context, Result};
use std::io::Read;
use std::path::Path;
use walkdir::WalkDir;

pub struct YaraScanner {
    rules: Option<yara_x::Rules>,
}

impl YaraScanner {
    /// Compile rules from a directory. `None` (or an empty path) builds a
    /// scanner that matches nothing, so a deployment without rules still
    /// runs the rest of the pipeline.
    pub fn new(rules_dir: Option<&Path>) -> Result<Self> {
        let Some(rules_dir) = rules_dir.filter(|dir| !dir.as_os_str().is_empty()) else {
            tracing::info!("no yara rules directory configured, rule scan disabled");
            return Ok(Self { rules: None });
        };

        let mut compiler = yara_x::Compiler::new();
        let mut loaded = 0usize;

        for entry in WalkDir::new(rules_dir) {
            let entry = entry.context("failed to walk yara rules directory")?;
            if !entry.file_type().is_file() {
                continue;
            }

            let source = std::fs::read_to_string(entry.path())
                .with_context(|| format!("failed to read rule {}", entry.path().display()))?;
            compiler
                .add_source(source.as_str())
                .with_context(|| format!("failed to compile rule {}", entry.path().display()))?;
            loaded += 1;
        }

        tracing::info!(files = loaded, "yara rules loaded");
        Ok(Self {
            rules: Some(compiler.build()),
        })
    }
}

impl SyncScanner for YaraScanner {
    fn name(&self) -> &'static str {
        "yara"
    }

    fn scan(&self, ctx: &ScanContext, buffer: &mut [u8]) -> Result<ScanResult> {
        let mut result = ScanResult::new("");

        let Some(rules) = &self.rules else {
            return Ok(result);
        };

        let mut file = ctx
            .storage
            .open(&ctx.filename)
            .with_context(|| format!("failed to open {} for rule scan", ctx.filename))?;

        let mut matches = 0i64;
        loop {
            let n = file
                .read(buffer)
                .with_context(|| format!("failed to read {}", ctx.filename))?;
            if n == 0 {
                break;
            }

            let mut scanner = yara_x::Scanner::new(rules);
            let chunk_results = scanner
                .scan(&buffer[..n])
                .with_context(|| format!("rule scan of {} failed", ctx.filename))?;
            matches += chunk_results.matching_rules().count() as i64;
        }

        result.matches = matches;
        Ok(result)
    }
}
