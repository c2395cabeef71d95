//! Source collector.
//!
//! Walks configured directories, single files, and URLs into [`SourceItem`]s
//! the incremental updater can diff against previously-seen metadata, and
//! resolves full content on demand. Directory and file reads are cheap
//! syscalls; URL reads go over the network, so both the enumeration pass and
//! the on-demand fetch are exposed separately — `collect(false)` lets the
//! updater's change-detection pass stay fast.

use crate::config::{SourceConfig, SourceKind, SourcePath};
use crate::models::SourceItem;
use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use std::time::Duration;
use walkdir::WalkDir;

/// Extensions this collector cannot turn into text; ingestion skips them
/// rather than attempting extraction (no document-extraction crate is
/// carried — see DESIGN.md).
const BINARY_EXTENSIONS: &[&str] = &[".pdf", ".docx", ".pptx", ".xlsx"];

pub struct SourceCollector {
    config: SourceConfig,
}

impl SourceCollector {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    /// Enumerate every source named by `source.paths`. When `read_content`
    /// is `false`, `content` is left `None` and callers that only need
    /// `last_modified`/`file_size` (change detection) avoid paying for
    /// reads or network round-trips up front.
    pub fn collect(&self, read_content: bool) -> Result<Vec<SourceItem>> {
        let mut items = Vec::new();
        for source_path in &self.config.paths {
            match source_path.kind {
                SourceKind::Directory => self.collect_directory(source_path, read_content, &mut items)?,
                SourceKind::File => self.collect_file(source_path, read_content, &mut items)?,
                SourceKind::Url => self.collect_url(source_path, read_content, &mut items)?,
            }
        }
        items.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(items)
    }

    fn collect_directory(
        &self,
        source_path: &SourcePath,
        read_content: bool,
        items: &mut Vec<SourceItem>,
    ) -> Result<()> {
        let root = Path::new(&source_path.path);
        if !root.exists() {
            bail!("source directory does not exist: {}", root.display());
        }

        let extensions: Vec<String> = if source_path.extensions.is_empty() {
            self.config.default_extensions.clone()
        } else {
            source_path.extensions.clone()
        };

        let mut excludes = self.config.global_exclude.clone();
        excludes.extend(source_path.exclude.iter().cloned());
        let exclude_set = build_globset(&excludes)?;

        let max_bytes = self.config.max_file_size_mb * 1024 * 1024;

        let mut walker = WalkDir::new(root);
        if !source_path.recursive {
            walker = walker.max_depth(1);
        }

        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let rel = path.strip_prefix(root).unwrap_or(path);
            let rel_str = rel.to_string_lossy().to_string();

            if exclude_set.is_match(&rel_str) {
                continue;
            }
            if !extensions.is_empty() && !has_extension(path, &extensions) {
                continue;
            }

            let metadata = std::fs::metadata(path)?;
            if metadata.len() > max_bytes {
                tracing::debug!(path = %path.display(), "source exceeds max_file_size_mb, skipped");
                continue;
            }

            let content = if read_content { Some(read_text(path)?) } else { None };

            items.push(SourceItem {
                source_id: path.to_string_lossy().to_string(),
                is_url: false,
                content,
                last_modified: modified_unix(&metadata),
                file_size: metadata.len() as i64,
            });
        }
        Ok(())
    }

    fn collect_file(
        &self,
        source_path: &SourcePath,
        read_content: bool,
        items: &mut Vec<SourceItem>,
    ) -> Result<()> {
        let path = Path::new(&source_path.path);
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("source file does not exist: {}", path.display()))?;

        let max_bytes = self.config.max_file_size_mb * 1024 * 1024;
        if metadata.len() > max_bytes {
            tracing::debug!(path = %path.display(), "source exceeds max_file_size_mb, skipped");
            return Ok(());
        }

        let content = if read_content { Some(read_text(path)?) } else { None };

        items.push(SourceItem {
            source_id: path.to_string_lossy().to_string(),
            is_url: false,
            content,
            last_modified: modified_unix(&metadata),
            file_size: metadata.len() as i64,
        });
        Ok(())
    }

    fn collect_url(
        &self,
        source_path: &SourcePath,
        read_content: bool,
        items: &mut Vec<SourceItem>,
    ) -> Result<()> {
        let url = source_path
            .url
            .as_ref()
            .with_context(|| "source path of type 'url' missing 'url' field")?;

        let content = if read_content {
            Some(fetch_url(url, &source_path.headers, source_path.url_timeout_ms)?)
        } else {
            None
        };

        let file_size = content.as_ref().map(|c| c.len() as i64).unwrap_or(0);

        items.push(SourceItem {
            source_id: url.clone(),
            is_url: true,
            content,
            last_modified: crate::models::now_unix(),
            file_size,
        });
        Ok(())
    }

    /// Resolve full content for a single source id on demand, regardless of
    /// whether it was collected with `read_content=false`.
    pub fn fetch_source(&self, uri: &str) -> Result<String> {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            return fetch_url(uri, &Default::default(), 10_000);
        }
        read_text(Path::new(uri))
    }

    /// Sources judged related to `primary`: files in the same directory
    /// sharing its stem (header/implementation pairs) first, then the rest
    /// of that directory, sorted for determinism and capped at
    /// `max_related`. Never includes `primary` itself.
    pub fn filter_related_sources(
        &self,
        all: &[SourceItem],
        primary: &str,
        max_related: usize,
    ) -> Vec<String> {
        let primary_path = Path::new(primary);
        let primary_parent = primary_path.parent();
        let primary_stem = primary_path.file_stem();

        let mut stem_matches = Vec::new();
        let mut dir_matches = Vec::new();

        for item in all {
            if item.source_id == primary {
                continue;
            }
            let path = Path::new(&item.source_id);
            if path.parent() != primary_parent {
                continue;
            }
            if primary_stem.is_some() && path.file_stem() == primary_stem {
                stem_matches.push(item.source_id.clone());
            } else {
                dir_matches.push(item.source_id.clone());
            }
        }
        stem_matches.sort();
        dir_matches.sort();
        stem_matches.into_iter().chain(dir_matches).take(max_related).collect()
    }
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default();
    extensions.iter().any(|e| e.to_lowercase() == ext)
}

fn modified_unix(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn read_text(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(err) => {
            let ext = path
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
                .unwrap_or_default();
            if BINARY_EXTENSIONS.contains(&ext.as_str()) {
                tracing::debug!(path = %path.display(), "binary extension with no extraction support, skipped");
                Ok(String::new())
            } else {
                Err(err).with_context(|| format!("failed to read source as UTF-8: {}", path.display()))
            }
        }
    }
}

fn fetch_url(url: &str, headers: &std::collections::HashMap<String, String>, timeout_ms: u64) -> Result<String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()?;

    let mut request = client.get(url);
    for (key, value) in headers {
        request = request.header(key.as_str(), value.as_str());
    }

    let response = request.send().with_context(|| format!("failed to fetch {url}"))?;
    if !response.status().is_success() {
        bail!("fetching {url} returned status {}", response.status());
    }
    response.text().with_context(|| format!("failed to read response body from {url}"))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;

    fn item(id: &str) -> SourceItem {
        SourceItem {
            source_id: id.to_string(),
            is_url: false,
            content: None,
            last_modified: 0,
            file_size: 0,
        }
    }

    fn collector() -> SourceCollector {
        SourceCollector::new(SourceConfig::default())
    }

    #[test]
    fn related_sources_prefer_matching_stem() {
        let c = collector();
        let all = vec![item("src/foo.h"), item("src/foo.cpp"), item("src/bar.cpp")];
        let related = c.filter_related_sources(&all, "src/foo.h", 10);
        assert_eq!(related, vec!["src/foo.cpp".to_string(), "src/bar.cpp".to_string()]);
    }

    #[test]
    fn related_sources_exclude_primary_and_other_directories() {
        let c = collector();
        let all = vec![item("src/foo.h"), item("other/foo.cpp"), item("src/bar.cpp")];
        let related = c.filter_related_sources(&all, "src/foo.h", 10);
        assert_eq!(related, vec!["src/bar.cpp".to_string()]);
    }

    #[test]
    fn related_sources_respect_cap() {
        let c = collector();
        let all = vec![item("src/a.cpp"), item("src/b.cpp"), item("src/c.cpp")];
        let related = c.filter_related_sources(&all, "src/main.h", 2);
        assert_eq!(related.len(), 2);
    }

    #[test]
    fn collect_directory_respects_extension_whitelist() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.md"), "hello").unwrap();
        std::fs::write(dir.path().join("skip.bin"), "hello").unwrap();

        let config = SourceConfig {
            paths: vec![SourcePath {
                kind: SourceKind::Directory,
                path: dir.path().to_string_lossy().to_string(),
                recursive: true,
                extensions: vec![".md".to_string()],
                exclude: vec![],
                url: None,
                headers: Default::default(),
                url_timeout_ms: 10_000,
            }],
            ..SourceConfig::default()
        };

        let collector = SourceCollector::new(config);
        let items = collector.collect(true).unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].source_id.ends_with("keep.md"));
    }

    #[test]
    fn collect_directory_respects_max_file_size() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.md"), "x".repeat(2048)).unwrap();

        let config = SourceConfig {
            max_file_size_mb: 0,
            paths: vec![SourcePath {
                kind: SourceKind::Directory,
                path: dir.path().to_string_lossy().to_string(),
                recursive: true,
                extensions: vec![".md".to_string()],
                exclude: vec![],
                url: None,
                headers: Default::default(),
                url_timeout_ms: 10_000,
            }],
            ..SourceConfig::default()
        };
        // max_file_size_mb = 0 means every file of any size is "too big"
        // since 0 * 1024 * 1024 = 0 bytes allowed.
        let collector = SourceCollector::new(config);
        let items = collector.collect(true).unwrap();
        assert!(items.is_empty());
    }
}
