use std::sync::Mutex;

use super::state::ReleaseId;

#[derive(Default)]
struct Sets {
    updated: Vec<ReleaseId>,
    deleted: Vec<ReleaseId>,
}

/// Thread-safe collector of releases touched during a run
///
/// Workers record into it concurrently; `display` renders the summary
/// apply/sync print at the end of a run.
#[derive(Default)]
pub struct Affected {
    inner: Mutex<Sets>,
}

impl Affected {
    pub fn new() -> Self {
        Affected::default()
    }

    pub fn note_updated(&self, id: ReleaseId) {
        let mut sets = self.inner.lock().unwrap();
        if !sets.updated.contains(&id) {
            sets.updated.push(id);
        }
    }

    pub fn note_deleted(&self, id: ReleaseId) {
        let mut sets = self.inner.lock().unwrap();
        if !sets.deleted.contains(&id) {
            sets.deleted.push(id);
        }
    }

    pub fn updated(&self) -> Vec<ReleaseId> {
        let mut xs = self.inner.lock().unwrap().updated.clone();
        xs.sort();
        xs
    }

    pub fn deleted(&self) -> Vec<ReleaseId> {
        let mut xs = self.inner.lock().unwrap().deleted.clone();
        xs.sort();
        xs
    }

    pub fn is_empty(&self) -> bool {
        let sets = self.inner.lock().unwrap();
        sets.updated.is_empty() && sets.deleted.is_empty()
    }

    /// Render the sorted, human-readable summary table
    pub fn display(&self) {
        if self.is_empty() {
            info!("No affected releases");
            return;
        }
        let updated = self.updated();
        let deleted = self.deleted();
        if !updated.is_empty() {
            info!("Updated releases:");
            for id in updated {
                info!("  {}", id);
            }
        }
        if !deleted.is_empty() {
            info!("Deleted releases:");
            for id in deleted {
                info!("  {}", id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Affected;
    use crate::state::ReleaseId;
    use std::sync::Arc;
    use std::thread;

    fn id(name: &str) -> ReleaseId {
        ReleaseId {
            context: "default".into(),
            namespace: "ns".into(),
            name: name.into(),
        }
    }

    #[test]
    fn output_is_sorted_and_deduplicated() {
        let a = Affected::new();
        a.note_updated(id("zeta"));
        a.note_updated(id("alpha"));
        a.note_updated(id("alpha"));
        a.note_deleted(id("gone"));
        assert_eq!(
            a.updated().iter().map(|i| i.name.clone()).collect::<Vec<_>>(),
            vec!["alpha", "zeta"]
        );
        assert_eq!(a.deleted().len(), 1);
        assert!(!a.is_empty());
    }

    #[test]
    fn concurrent_recording() {
        let a = Arc::new(Affected::new());
        let mut handles = vec![];
        for i in 0..8 {
            let a = a.clone();
            handles.push(thread::spawn(move || {
                a.note_updated(id(&format!("r{}", i)));
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(a.updated().len(), 8);
    }
}
