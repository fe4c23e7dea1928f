use super::{DispatchStore, StoreError, TaskDocument};
use crate::scheduling::schedule::Schedule;
use crate::shared::ids::{CallId, ScheduleId};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Documents {
    tasks: BTreeMap<CallId, TaskDocument>,
    schedules: BTreeMap<ScheduleId, Schedule>,
}

/// Process-local store; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<Documents>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn documents(&self) -> MutexGuard<'_, Documents> {
        match self.documents.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl DispatchStore for MemoryStore {
    fn save_task(&self, doc: &TaskDocument) -> Result<(), StoreError> {
        self.documents()
            .tasks
            .insert(doc.request.id.clone(), doc.clone());
        Ok(())
    }

    fn load_task(&self, id: &CallId) -> Result<Option<TaskDocument>, StoreError> {
        Ok(self.documents().tasks.get(id).cloned())
    }

    fn remove_task(&self, id: &CallId) -> Result<bool, StoreError> {
        Ok(self.documents().tasks.remove(id).is_some())
    }

    fn list_tasks(&self) -> Result<Vec<TaskDocument>, StoreError> {
        let mut tasks: Vec<TaskDocument> = self.documents().tasks.values().cloned().collect();
        tasks.sort_by_key(|doc| doc.enqueued_at);
        Ok(tasks)
    }

    fn save_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
        self.documents()
            .schedules
            .insert(schedule.id.clone(), schedule.clone());
        Ok(())
    }

    fn load_schedule(&self, id: &ScheduleId) -> Result<Option<Schedule>, StoreError> {
        Ok(self.documents().schedules.get(id).cloned())
    }

    fn remove_schedule(&self, id: &ScheduleId) -> Result<bool, StoreError> {
        Ok(self.documents().schedules.remove(id).is_some())
    }

    fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        let mut schedules: Vec<Schedule> = self.documents().schedules.values().cloned().collect();
        schedules.sort_by_key(|schedule| schedule.created_at);
        Ok(schedules)
    }
}
