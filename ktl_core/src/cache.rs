//! C10: content-addressed cache for rendered manifests, keyed by a
//! chart+values fingerprint, with at-most-one concurrent render per
//! fingerprint (spec §4.10, invariant 6).

use crate::collaborators::{HelmRenderer, RenderInput, RenderedManifest};
use crate::error::Result;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

pub type Fingerprint = String;

pub fn fingerprint(
    chart: &str,
    values_content: &[String],
    set: &[String],
    namespace: &str,
    chart_version: &str,
) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(chart.as_bytes());
    hasher.update(b"\n");
    for v in values_content {
        hasher.update(v.as_bytes());
        hasher.update(b"\n");
    }
    for s in set {
        hasher.update(s.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(namespace.as_bytes());
    hasher.update(b"\n");
    hasher.update(chart_version.as_bytes());
    hex::encode(hasher.finalize())
}

type RenderFuture = Shared<BoxFuture<'static, std::result::Result<Arc<RenderedManifest>, String>>>;

struct Entry {
    future: RenderFuture,
    bytes: AtomicUsize,
}

/// LRU-evicted, coalescing render cache. Optionally mirrors entries to a
/// disk-backed directory.
pub struct RenderCache {
    inflight: AsyncMutex<HashMap<Fingerprint, Arc<Entry>>>,
    byte_budget: usize,
    used_bytes: AtomicUsize,
    recency: AsyncMutex<Vec<Fingerprint>>,
    disk_dir: Option<std::path::PathBuf>,
}

impl RenderCache {
    pub fn new(byte_budget: usize, disk_dir: Option<std::path::PathBuf>) -> Self {
        RenderCache {
            inflight: AsyncMutex::new(HashMap::new()),
            byte_budget,
            used_bytes: AtomicUsize::new(0),
            recency: AsyncMutex::new(Vec::new()),
            disk_dir,
        }
    }

    /// Render `fp`, coalescing concurrent callers onto the same future. The
    /// first caller computes by invoking `renderer`; later callers for the
    /// same fingerprint await the same in-flight future.
    pub async fn render_coalesced(
        &self,
        fp: &Fingerprint,
        renderer: Arc<dyn HelmRenderer>,
        input_owned: OwnedRenderInput,
    ) -> Result<Arc<RenderedManifest>> {
        if let Some(cached) = self.disk_lookup(fp).await {
            self.touch(fp).await;
            return Ok(Arc::new(cached));
        }

        let mut guard = self.inflight.lock().await;
        if let Some(entry) = guard.get(fp).cloned() {
            drop(guard);
            return entry
                .future
                .clone()
                .await
                .map_err(|e| crate::error::Error::Render {
                    node: crate::plan::ReleaseId(input_owned.release_name.clone()),
                    retryable: false,
                    source: Box::new(crate::error::Error::Config(e)),
                });
        }

        let fp_for_future = fp.clone();
        let disk_dir = self.disk_dir.clone();
        let release_name = input_owned.release_name.clone();
        let fut: BoxFuture<'static, std::result::Result<Arc<RenderedManifest>, String>> =
            async move {
                let owned = input_owned;
                let input = RenderInput {
                    chart: &owned.chart,
                    release_name: &owned.release_name,
                    namespace: &owned.namespace,
                    values: &owned.values,
                    set: &owned.set,
                };
                let manifest = renderer.render(input).await.map_err(|e| e.to_string())?;
                if let Some(dir) = &disk_dir {
                    let _ = persist_disk(dir, &fp_for_future, &manifest);
                }
                Ok(Arc::new(manifest))
            }
            .boxed();
        let entry = Arc::new(Entry { future: fut.shared(), bytes: AtomicUsize::new(0) });
        guard.insert(fp.clone(), entry.clone());
        drop(guard);

        let result = entry.future.clone().await;
        if let Ok(manifest) = &result {
            let size = serde_json::to_vec(manifest.as_ref()).map(|b| b.len()).unwrap_or(0);
            entry.bytes.store(size, Ordering::Relaxed);
            self.used_bytes.fetch_add(size, Ordering::Relaxed);
        }
        self.touch(fp).await;
        self.evict_if_needed().await;

        result.map_err(|e| crate::error::Error::Render {
            node: crate::plan::ReleaseId(release_name),
            retryable: false,
            source: Box::new(crate::error::Error::Config(e)),
        })
    }

    async fn touch(&self, fp: &Fingerprint) {
        let mut recency = self.recency.lock().await;
        recency.retain(|f| f != fp);
        recency.push(fp.clone());
    }

    async fn evict_if_needed(&self) {
        let mut inflight = self.inflight.lock().await;
        let mut recency = self.recency.lock().await;
        while self.used_bytes.load(Ordering::Relaxed) > self.byte_budget && !recency.is_empty() {
            let oldest = recency.remove(0);
            if let Some(entry) = inflight.remove(&oldest) {
                self.used_bytes
                    .fetch_sub(entry.bytes.load(Ordering::Relaxed), Ordering::Relaxed);
            }
        }
    }

    async fn disk_lookup(&self, fp: &Fingerprint) -> Option<RenderedManifest> {
        let dir = self.disk_dir.as_ref()?;
        let path = dir.join(format!("{fp}.json"));
        let bytes = std::fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

#[derive(Clone)]
pub struct OwnedRenderInput {
    pub chart: String,
    pub release_name: String,
    pub namespace: String,
    pub values: Vec<std::path::PathBuf>,
    pub set: Vec<String>,
}

fn persist_disk(dir: &Path, fp: &Fingerprint, manifest: &RenderedManifest) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{fp}.json"));
    let bytes = serde_json::to_vec(manifest).unwrap_or_default();
    std::fs::write(path, bytes)
}

// `RenderedManifest` needs (de)serialization only for the disk cache tier.
impl serde::Serialize for RenderedManifest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("RenderedManifest", 4)?;
        s.serialize_field("objects", &self.objects)?;
        s.serialize_field("digest", &hex::encode(self.digest))?;
        s.serialize_field("chart_version", &self.chart_version)?;
        s.serialize_field("notes", &self.notes)?;
        s.end()
    }
}

impl<'de> serde::Deserialize<'de> for RenderedManifest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(serde::Deserialize)]
        struct Raw {
            objects: Vec<crate::collaborators::K8sObject>,
            digest: String,
            chart_version: String,
            notes: String,
        }
        let raw = Raw::deserialize(deserializer)?;
        let mut digest = [0u8; 32];
        if let Ok(bytes) = hex::decode(&raw.digest) {
            if bytes.len() == 32 {
                digest.copy_from_slice(&bytes);
            }
        }
        Ok(RenderedManifest {
            objects: raw.objects,
            digest,
            chart_version: raw.chart_version,
            notes: raw.notes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::testutil::FakeHelm;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    #[tokio::test]
    async fn coalesces_concurrent_renders_for_same_fingerprint() {
        let calls = Arc::new(StdAtomicUsize::new(0));
        let helm = Arc::new(CountingHelm { calls: calls.clone(), inner: FakeHelm::default() });
        let cache = Arc::new(RenderCache::new(usize::MAX, None));
        let fp = fingerprint("charts/x", &[], &[], "ns", "1.0.0");

        let input = OwnedRenderInput {
            chart: "charts/x".into(),
            release_name: "r".into(),
            namespace: "ns".into(),
            values: vec![],
            set: vec![],
        };

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let helm = helm.clone() as Arc<dyn HelmRenderer>;
            let fp = fp.clone();
            let input = input.clone();
            handles.push(tokio::spawn(async move {
                cache.render_coalesced(&fp, helm, input).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // One render call no matter how many concurrent callers asked for it.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct CountingHelm {
        calls: Arc<StdAtomicUsize>,
        inner: FakeHelm,
    }

    #[async_trait::async_trait]
    impl HelmRenderer for CountingHelm {
        async fn render(&self, input: RenderInput<'_>) -> Result<RenderedManifest> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.render(input).await
        }
    }

    fn manifest_with_notes(notes: &str) -> RenderedManifest {
        RenderedManifest {
            objects: vec![],
            digest: [0u8; 32],
            chart_version: "0.0.0".into(),
            notes: notes.to_string(),
        }
    }

    #[tokio::test]
    async fn evicts_the_oldest_entry_once_the_byte_budget_is_exceeded() {
        let helm = Arc::new(FakeHelm::default());
        helm.set("charts/a", manifest_with_notes(&"a".repeat(100)));
        helm.set("charts/b", manifest_with_notes(&"b".repeat(100)));

        // Large enough for one entry (~226 bytes serialized), not two.
        let cache = RenderCache::new(300, None);
        let fp_a = fingerprint("charts/a", &[], &[], "ns", "1.0.0");
        let fp_b = fingerprint("charts/b", &[], &[], "ns", "1.0.0");

        let input = |chart: &str| OwnedRenderInput {
            chart: chart.into(),
            release_name: "r".into(),
            namespace: "ns".into(),
            values: vec![],
            set: vec![],
        };

        cache
            .render_coalesced(&fp_a, helm.clone() as Arc<dyn HelmRenderer>, input("charts/a"))
            .await
            .unwrap();
        assert!(cache.inflight.lock().await.contains_key(&fp_a));

        cache
            .render_coalesced(&fp_b, helm.clone() as Arc<dyn HelmRenderer>, input("charts/b"))
            .await
            .unwrap();

        // Pulling in b pushed total usage over budget, evicting the older a.
        assert!(!cache.inflight.lock().await.contains_key(&fp_a));
        assert!(cache.inflight.lock().await.contains_key(&fp_b));
        assert!(cache.used_bytes.load(Ordering::Relaxed) <= 300);
    }
}
