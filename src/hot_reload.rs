// Shader hot-reload
//
// Watches the directories holding the shader sources. Editors often save by
// writing a new file and renaming it over the old one, which drops a watch
// placed on the file itself, so the parent directory is watched and events
// are filtered by path. The watcher thread only feeds a channel; the main
// loop drains it once per tick.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};

pub struct ShaderWatcher {
    // Dropping the watcher stops the background thread
    _watcher: RecommendedWatcher,
    events: Receiver<notify::Result<Event>>,
    files: Vec<PathBuf>,
}

impl ShaderWatcher {
    pub fn new(files: &[&Path]) -> Result<Self> {
        let (tx, events) = channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })
        .context("Failed to create file watcher")?;

        let files: Vec<PathBuf> = files.iter().map(|f| absolute(f)).collect();
        let dirs: BTreeSet<&Path> = files.iter().filter_map(|f| f.parent()).collect();
        for dir in dirs {
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("Failed to watch {:?}", dir))?;
            log::info!("Watching {:?} for shader changes", dir);
        }

        Ok(Self {
            _watcher: watcher,
            events,
            files,
        })
    }

    /// Drain pending events; true if any touched a watched shader
    pub fn poll_changed(&self) -> bool {
        let mut changed = false;
        for res in self.events.try_iter() {
            match res {
                Ok(event) => {
                    if is_shader_change(&event, &self.files) {
                        log::debug!("Shader change: {:?}", event.paths);
                        changed = true;
                    }
                }
                Err(e) => log::warn!("File watcher error: {}", e),
            }
        }
        changed
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    })
}

/// Content writes and re-creations count; metadata-only and access events don't
pub fn is_shader_change(event: &Event, files: &[PathBuf]) -> bool {
    let relevant_kind = match event.kind {
        EventKind::Create(_) => true,
        EventKind::Modify(notify::event::ModifyKind::Metadata(_)) => false,
        EventKind::Modify(_) => true,
        _ => false,
    };
    relevant_kind && event.paths.iter().any(|p| files.iter().any(|f| f == p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, MetadataKind, ModifyKind, RemoveKind};

    fn files() -> Vec<PathBuf> {
        vec![
            PathBuf::from("/project/shaders/triangle.vert"),
            PathBuf::from("/project/shaders/triangle.frag"),
        ]
    }

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn content_change_of_watched_file_counts() {
        let e = event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            "/project/shaders/triangle.frag",
        );
        assert!(is_shader_change(&e, &files()));
    }

    #[test]
    fn recreated_file_counts() {
        let e = event(EventKind::Create(CreateKind::File), "/project/shaders/triangle.vert");
        assert!(is_shader_change(&e, &files()));
    }

    #[test]
    fn other_files_in_directory_are_ignored() {
        let e = event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            "/project/shaders/notes.txt",
        );
        assert!(!is_shader_change(&e, &files()));
    }

    #[test]
    fn metadata_access_and_removal_are_ignored() {
        let path = "/project/shaders/triangle.vert";
        for kind in [
            EventKind::Modify(ModifyKind::Metadata(MetadataKind::WriteTime)),
            EventKind::Access(AccessKind::Read),
            EventKind::Remove(RemoveKind::File),
        ] {
            assert!(!is_shader_change(&event(kind, path), &files()));
        }
    }
}
