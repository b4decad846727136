//! Live-table subscription discipline (§4.4.3): only one subscription is
//! active at a time, a background task polls it at a fixed interval,
//! diffs against a cheap change hash, and emits `table_update` only on
//! change. A single write-lock (the shared `Stdout`) guards output
//! because this task shares the channel with the request/reply loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dh_types::repl_proto::{Reply, TableWindow};
use dh_types::vsock_proto::TablePreview;
use tokio::sync::{watch, Mutex};

use crate::backend::Backend;
use crate::Stdout;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct SubscriptionManager {
    backend: Arc<dyn Backend>,
    stdout: Arc<Stdout>,
    current: Mutex<Option<(String, watch::Sender<bool>)>>,
}

impl SubscriptionManager {
    pub fn new(backend: Arc<dyn Backend>, stdout: Arc<Stdout>) -> Self {
        Self { backend, stdout, current: Mutex::new(None) }
    }

    pub async fn subscribe(
        &self,
        name: String,
        offset: u64,
        limit: u64,
        known_tables: Arc<Mutex<HashMap<String, TablePreview>>>,
    ) {
        self.cancel_current().await;

        let (stop_tx, stop_rx) = watch::channel(false);
        {
            let mut current = self.current.lock().await;
            *current = Some((name.clone(), stop_tx));
        }

        let backend = Arc::clone(&self.backend);
        let stdout = Arc::clone(&self.stdout);
        tokio::spawn(poll_loop(backend, stdout, known_tables, name, offset, limit, stop_rx));
    }

    pub async fn unsubscribe(&self, name: &str) {
        let mut current = self.current.lock().await;
        if current.as_ref().map(|(n, _)| n.as_str()) == Some(name) {
            if let Some((_, tx)) = current.take() {
                let _ = tx.send(true);
            }
        }
    }

    pub async fn stop(&self) {
        self.cancel_current().await;
    }

    async fn cancel_current(&self) {
        let mut current = self.current.lock().await;
        if let Some((_, tx)) = current.take() {
            let _ = tx.send(true);
        }
    }
}

async fn poll_loop(
    backend: Arc<dyn Backend>,
    stdout: Arc<Stdout>,
    known_tables: Arc<Mutex<HashMap<String, TablePreview>>>,
    name: String,
    offset: u64,
    limit: u64,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut last_hash: Option<u64> = None;
    loop {
        if *stop_rx.borrow() {
            return;
        }
        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
        if *stop_rx.borrow() {
            return;
        }

        let reply = match backend.exec(&name, true, true).await {
            Ok(r) => r,
            Err(_) => continue,
        };
        let Some(preview) = reply.tables.into_iter().find(|t| t.name == name) else {
            continue;
        };

        let hash = change_hash(&preview);
        if last_hash == Some(hash) {
            continue;
        }
        last_hash = Some(hash);

        known_tables.lock().await.insert(name.clone(), preview.clone());
        let window = preview_to_window(&preview, offset, limit);
        stdout.write_reply(&Reply::TableUpdate { table: preview, window }).await;
    }
}

/// Cheap change detector from §4.4.3: total rows, window row count, and
/// first/last row values.
fn change_hash(preview: &TablePreview) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    preview.row_count.hash(&mut hasher);
    preview.is_refreshing.hash(&mut hasher);
    preview.preview.lines().next().hash(&mut hasher);
    preview.preview.lines().last().hash(&mut hasher);
    hasher.finish()
}

/// Best-effort bridge from the engine's rendered preview string into
/// structured cells: `TablePreview.preview` is whatever text the
/// out-of-scope engine chose to render, so this splits it line by line
/// and each line on runs of whitespace, padding/truncating to the known
/// column count.
pub fn preview_to_window(preview: &TablePreview, offset: u64, limit: u64) -> TableWindow {
    let ncols = preview.columns.len().max(1);
    let rows: Vec<Vec<String>> = preview
        .preview
        .lines()
        .skip(offset as usize)
        .take(limit as usize)
        .map(|line| {
            let mut cells: Vec<String> = line.split_whitespace().map(str::to_string).collect();
            cells.resize(ncols, String::new());
            cells
        })
        .collect();

    TableWindow {
        name: preview.name.clone(),
        offset,
        rows,
        total_rows: preview.row_count,
        columns: preview.columns.clone(),
    }
}
