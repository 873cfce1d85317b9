use std::collections::HashMap;

use kube::{Resource, ResourceExt};
use kube::runtime::watcher;

/// Passes an object on first sight and whenever its `metadata.generation` moves.
///
/// Status subresource writes do not bump the generation, so the Job watch updating
/// `.status` never wakes the reconciler back up.
#[derive(Debug, Default)]
pub(crate) struct GenerationFilter {
    seen: HashMap<String, Option<i64>>,
}

impl GenerationFilter {
    fn identity<K: Resource>(obj: &K) -> String {
        obj.uid().unwrap_or_else(|| {
            format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
        })
    }

    pub(crate) fn observe<K: Resource>(&mut self, obj: &K) -> bool {
        let generation = obj.meta().generation;
        let previous = self.seen.insert(Self::identity(obj), generation);
        previous != Some(generation)
    }

    pub(crate) fn forget<K: Resource>(&mut self, obj: &K) {
        self.seen.remove(&Self::identity(obj));
    }

    /// Maps one watcher event to the object the controller should reconcile, if any.
    pub(crate) fn filter_event<K: Resource>(
        &mut self,
        event: Result<watcher::Event<K>, watcher::Error>,
    ) -> Option<Result<K, watcher::Error>> {
        match event {
            Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                self.observe(&obj).then_some(Ok(obj))
            }
            Ok(watcher::Event::Delete(obj)) => {
                self.forget(&obj);
                None
            }
            Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
