//! Directory Watcher (C6, spec §4.5). Subscribes to create/modify events
//! across N configured directories via the `notify` crate and forwards
//! matching paths to the Stability Detector.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use notify::event::{CreateKind, DataChange, EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{info, warn};

const CHANNEL_CAPACITY: usize = 4096;
const DEFAULT_EXTENSIONS: &[&str] = &["jsonl", "json", "log"];

fn is_temp_file(path: &std::path::Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return true,
    };
    name.starts_with('.') || name.starts_with('~') || name.ends_with(".swp") || name.ends_with(".tmp")
}

fn extension_matches(path: &std::path::Path, extensions: &[String]) -> bool {
    let ext = match path.extension().and_then(|e| e.to_str()) {
        Some(e) => e,
        None => return false,
    };
    if extensions.is_empty() {
        return DEFAULT_EXTENSIONS.iter().any(|e| e.eq_ignore_ascii_case(ext));
    }
    extensions
        .iter()
        .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(ext))
}

/// Delivers filesystem paths that changed across every watched directory.
pub struct DirectoryWatcher {
    // Must stay alive — dropping stops delivery.
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<PathBuf>,
    dropped: Arc<AtomicU64>,
}

impl DirectoryWatcher {
    /// Watch `dirs`, capped at `max_directories` (§4.5: "holds a single hard
    /// cap `max_directories`; additional directories are refused").
    pub fn new(
        dirs: &[PathBuf],
        extensions: Vec<String>,
        max_directories: usize,
    ) -> notify::Result<Self> {
        let accepted: Vec<&PathBuf> = dirs.iter().take(max_directories).collect();
        if dirs.len() > max_directories {
            warn!(
                requested = dirs.len(),
                cap = max_directories,
                "monitoring_paths exceeds max_directories, extra directories refused"
            );
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let dropped = Arc::new(AtomicU64::new(0));
        let dropped_clone = dropped.clone();
        let extensions_clone = extensions.clone();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(e) => e,
                Err(_) => return,
            };

            match event.kind {
                EventKind::Create(CreateKind::File | CreateKind::Any)
                | EventKind::Modify(ModifyKind::Data(_))
                | EventKind::Modify(ModifyKind::Any)
                | EventKind::Modify(ModifyKind::Name(_)) => {}
                _ => return,
            }

            for path in event.paths {
                if is_temp_file(&path) || !extension_matches(&path, &extensions_clone) {
                    continue;
                }
                if tx.try_send(path).is_err() {
                    let n = dropped_clone.fetch_add(1, Ordering::Relaxed) + 1;
                    if n % 1000 == 0 {
                        warn!(dropped = n, "directory watcher channel full, events dropped");
                    }
                }
            }
        })?;

        for dir in &accepted {
            if dir.exists() {
                watcher.watch(dir, RecursiveMode::Recursive)?;
                info!(dir = %dir.display(), "watching directory");
            } else {
                warn!(dir = %dir.display(), "monitoring path does not exist at startup");
            }
        }

        Ok(Self {
            _watcher: watcher,
            rx,
            dropped,
        })
    }

    /// Pull the next changed path. Returns `None` once the watcher has shut down.
    pub async fn next_event(&mut self) -> Option<PathBuf> {
        self.rx.recv().await
    }

    pub fn dropped_event_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_list_filter() {
        let extensions = vec!["jsonl".to_string()];
        assert!(extension_matches(std::path::Path::new("a.jsonl"), &extensions));
        assert!(!extension_matches(std::path::Path::new("a.txt"), &extensions));
    }

    #[test]
    fn default_extensions_when_list_empty() {
        let extensions = vec![];
        assert!(extension_matches(std::path::Path::new("a.log"), &extensions));
        assert!(!extension_matches(std::path::Path::new("a.exe"), &extensions));
    }

    #[test]
    fn temp_files_are_ignored() {
        assert!(is_temp_file(std::path::Path::new(".a.jsonl.swp")));
        assert!(is_temp_file(std::path::Path::new("~a.jsonl")));
        assert!(!is_temp_file(std::path::Path::new("a.jsonl")));
    }
}
