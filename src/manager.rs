use anyhow::Result;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::{error, info};

use crate::config::Config;
use crate::inference::{
    bert_embedder::BertEmbedder, qwen::QwenChat, snapshot, ChatModel, TextEmbedder,
};

type Loader<T> = Box<dyn Fn() -> Result<Arc<T>> + Send + Sync>;

/// A model constructed on first use and kept for the life of the process.
///
/// Concurrent first callers block on the same initialisation, so the loader
/// runs at most once at a time. A failed load leaves the slot empty and the
/// next caller retries.
pub struct LazyModel<T: ?Sized> {
    name: &'static str,
    cell: OnceCell<Arc<T>>,
    loader: Loader<T>,
}

impl<T: ?Sized> LazyModel<T> {
    pub fn new<F>(name: &'static str, loader: F) -> Self
    where
        F: Fn() -> Result<Arc<T>> + Send + Sync + 'static,
    {
        Self {
            name,
            cell: OnceCell::new(),
            loader: Box::new(loader),
        }
    }

    /// Returns the cached handle, loading it first if needed. Blocking.
    pub fn get(&self) -> Result<Arc<T>> {
        self.cell
            .get_or_try_init(|| {
                info!(model = self.name, "loading model (first use)");
                (self.loader)().map_err(|err| {
                    error!(model = self.name, "Error loading {} model: {err:#}", self.name);
                    err
                })
            })
            .cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }
}

/// Process-wide model handles shared by all request handlers.
pub struct ModelRegistry {
    pub embedder: LazyModel<dyn TextEmbedder>,
    pub chat: LazyModel<dyn ChatModel>,
}

impl ModelRegistry {
    pub fn new(embedder: LazyModel<dyn TextEmbedder>, chat: LazyModel<dyn ChatModel>) -> Self {
        Self { embedder, chat }
    }

    /// Candle-backed models resolved from `config`; nothing is loaded yet.
    pub fn from_config(config: &Config) -> Self {
        let embed_source = config.embed_source();
        let embed_device = config.device.clone();
        let embedder = LazyModel::new("embedding", move || {
            let device = snapshot::parse_device(&embed_device)?;
            let model: Arc<dyn TextEmbedder> = Arc::new(BertEmbedder::load(&embed_source, device)?);
            Ok(model)
        });

        let chat_source = config.chat_source();
        let chat_device = config.device.clone();
        let template = config.chat_template_path.clone();
        let chat = LazyModel::new("chat", move || {
            let device = snapshot::parse_device(&chat_device)?;
            let model: Arc<dyn ChatModel> =
                Arc::new(QwenChat::load(&chat_source, device, template.clone())?);
            Ok(model)
        });

        Self::new(embedder, chat)
    }

    /// Load both models now. Failures are logged; the lazy path retries.
    pub fn preload(&self) {
        let _ = self.embedder.get();
        let _ = self.chat.get();
        info!(
            embedder = self.embedder.is_loaded(),
            chat = self.chat.is_loaded(),
            "preload finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    struct FixedEmbedder(usize);

    impl TextEmbedder for FixedEmbedder {
        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.5; self.0])
        }
    }

    #[test]
    fn loads_once_and_reuses_handle() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let slot: LazyModel<dyn TextEmbedder> = LazyModel::new("test", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FixedEmbedder(4)) as Arc<dyn TextEmbedder>)
        });

        assert!(!slot.is_loaded());
        let a = slot.get().unwrap();
        let b = slot.get().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(slot.is_loaded());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_load_leaves_slot_empty_and_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let slot: LazyModel<dyn TextEmbedder> = LazyModel::new("flaky", move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(anyhow!("weights missing"))
            } else {
                Ok(Arc::new(FixedEmbedder(2)) as Arc<dyn TextEmbedder>)
            }
        });

        let err = slot.get().err().expect("first load must fail");
        assert!(err.to_string().contains("weights missing"));
        assert!(!slot.is_loaded());

        let model = slot.get().unwrap();
        assert_eq!(model.embed("x").unwrap().len(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_first_use_constructs_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let slot: Arc<LazyModel<dyn TextEmbedder>> = Arc::new(LazyModel::new("race", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            Ok(Arc::new(FixedEmbedder(3)) as Arc<dyn TextEmbedder>)
        }));

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let slot = slot.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    slot.get().unwrap().embed("x").unwrap().len()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 3);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}
