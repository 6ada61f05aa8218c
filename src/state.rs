use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

pub trait DeviceState: Send + Sync {
    /// Whether `present` differs from the last value seen for `id`. A changed
    /// value is stored; the first observation of an id always counts as a change.
    fn has_state_changed(&self, id: &str, present: bool) -> bool;
}

/// In-memory presence per device name, living as long as the process.
#[derive(Debug, Default)]
pub struct MapState {
    state: RwLock<HashMap<String, bool>>,
}

impl MapState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<bool> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied()
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> HashMap<String, bool> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DeviceState for MapState {
    fn has_state_changed(&self, id: &str, present: bool) -> bool {
        // Unknown ids compare against the opposite value so they register as changed
        let previous = self.get(id).unwrap_or(!present);
        if previous == present {
            return false;
        }

        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), present);
        true
    }
}
