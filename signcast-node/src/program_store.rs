use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::{Result, StoreError};
use crate::kv_store::{KeyValueStore, PROGRAMS_KEY};
use crate::models::Program;

pub const EXPORT_VERSION: &str = "1.0.0";

/// Source of the program set the scheduler plays.
#[async_trait]
pub trait ProgramStore: Send + Sync {
    async fn get_programs(&self) -> Result<Vec<Program>>;
    async fn create_program(&self, program: Program) -> Result<Program>;
    async fn update_program(&self, program: Program) -> Result<Program>;
    async fn delete_program(&self, id: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageInfo {
    pub total_programs: usize,
    pub storage_size: usize,
    pub last_modified: Option<DateTime<Utc>>,
}

impl StorageInfo {
    pub fn size_kb(&self) -> String {
        format!("{:.2} KB", self.storage_size as f64 / 1024.0)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgramExport {
    programs: Vec<Program>,
    export_date: DateTime<Utc>,
    version: String,
}

/// Program Store backed by the local key-value store, one JSON array under
/// a single key.
pub struct LocalProgramStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    // Serializes read-modify-write cycles
    write_lock: tokio::sync::Mutex<()>,
}

impl LocalProgramStore {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn load(&self) -> Result<Vec<Program>> {
        match self.store.get(PROGRAMS_KEY)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, programs: &[Program]) -> Result<()> {
        let json = serde_json::to_string(programs)?;
        self.store.set(PROGRAMS_KEY, &json)
    }

    fn touch(&self, program: &mut Program) {
        program.content = program.content_count();
        program.last_modified = self.clock.now();
    }

    pub fn export_data(&self) -> Result<String> {
        let export = ProgramExport {
            programs: self.load()?,
            export_date: self.clock.now(),
            version: EXPORT_VERSION.to_string(),
        };
        Ok(serde_json::to_string_pretty(&export)?)
    }

    /// Replaces every stored program. Returns false, leaving the store
    /// untouched, when `programs` is missing or not an array of programs.
    pub async fn import_data(&self, data: &str) -> bool {
        let parsed: serde_json::Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Error importing programs: {}", e);
                return false;
            }
        };

        let Some(list) = parsed.get("programs").filter(|p| p.is_array()) else {
            tracing::error!("Error importing programs: missing programs array");
            return false;
        };

        let programs: Vec<Program> = match serde_json::from_value(list.clone()) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("Error importing programs: {}", e);
                return false;
            }
        };

        let _guard = self.write_lock.lock().await;
        match self.save(&programs) {
            Ok(()) => {
                tracing::info!("Imported {} program(s)", programs.len());
                true
            }
            Err(e) => {
                tracing::error!("Error saving imported programs: {}", e);
                false
            }
        }
    }

    pub fn storage_info(&self) -> Result<StorageInfo> {
        let raw = self.store.get(PROGRAMS_KEY)?;
        let programs: Vec<Program> = match &raw {
            Some(raw) => serde_json::from_str(raw)?,
            None => Vec::new(),
        };

        Ok(StorageInfo {
            total_programs: programs.len(),
            storage_size: raw.map(|r| r.len()).unwrap_or(0),
            last_modified: programs.iter().map(|p| p.last_modified).max(),
        })
    }

    pub async fn clear_programs(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store.remove(PROGRAMS_KEY)?;
        tracing::info!("All programs removed");
        Ok(())
    }
}

#[async_trait]
impl ProgramStore for LocalProgramStore {
    async fn get_programs(&self) -> Result<Vec<Program>> {
        self.load()
    }

    async fn create_program(&self, mut program: Program) -> Result<Program> {
        let _guard = self.write_lock.lock().await;
        let mut programs = self.load()?;

        if program.id.is_empty() {
            program.id = uuid::Uuid::new_v4().to_string();
        } else if programs.iter().any(|p| p.id == program.id) {
            return Err(StoreError::InvalidData(format!(
                "program {} already exists",
                program.id
            )));
        }

        program.created_at = self.clock.now();
        self.touch(&mut program);
        programs.push(program.clone());
        self.save(&programs)?;

        tracing::info!("Program created: {} ({})", program.name, program.id);
        Ok(program)
    }

    async fn update_program(&self, mut program: Program) -> Result<Program> {
        let _guard = self.write_lock.lock().await;
        let mut programs = self.load()?;

        let slot = programs
            .iter_mut()
            .find(|p| p.id == program.id)
            .ok_or_else(|| StoreError::NotFound(program.id.clone()))?;

        self.touch(&mut program);
        *slot = program.clone();
        self.save(&programs)?;

        tracing::info!("Program updated: {} ({})", program.name, program.id);
        Ok(program)
    }

    async fn delete_program(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut programs = self.load()?;

        let before = programs.len();
        programs.retain(|p| p.id != id);
        if programs.len() == before {
            return Err(StoreError::NotFound(id.to_string()));
        }

        self.save(&programs)?;
        tracing::info!("Program deleted: {}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kv_store::{JsonFileStore, MemoryStore};
    use crate::models::fixtures::{content, program, zone};
    use crate::models::ContentType;
    use chrono::TimeZone;

    fn setup() -> (LocalProgramStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        ));
        (
            LocalProgramStore::new(Arc::new(MemoryStore::new()), clock.clone()),
            clock,
        )
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_counts_content() {
        let (store, clock) = setup();
        let mut draft = program(
            "",
            vec![zone(
                "z",
                vec![
                    content("a", ContentType::Image),
                    content("b", ContentType::Video),
                ],
            )],
        );
        draft.content = 0;

        let created = store.create_program(draft).await.unwrap();
        assert!(uuid::Uuid::parse_str(&created.id).is_ok());
        assert_eq!(created.content, 2);
        assert_eq!(created.last_modified, clock.now());

        let listed = store.get_programs().await.unwrap();
        assert_eq!(listed, vec![created]);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let (store, _) = setup();
        store.create_program(program("p1", vec![])).await.unwrap();
        let err = store.create_program(program("p1", vec![])).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)));
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let (store, clock) = setup();
        let created = store.create_program(program("p1", vec![])).await.unwrap();

        clock.advance(chrono::Duration::hours(1));
        let mut changed = created.clone();
        changed.zones.push(zone("z", vec![content("a", ContentType::Image)]));
        let updated = store.update_program(changed).await.unwrap();
        assert_eq!(updated.content, 1);
        assert!(updated.last_modified > created.last_modified);

        assert!(matches!(
            store.update_program(program("ghost", vec![])).await,
            Err(StoreError::NotFound(_))
        ));

        store.delete_program("p1").await.unwrap();
        assert!(store.get_programs().await.unwrap().is_empty());
        assert!(matches!(
            store.delete_program("p1").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_export_import() {
        let (store, _) = setup();
        store.create_program(program("p1", vec![])).await.unwrap();
        store.create_program(program("p2", vec![])).await.unwrap();
        let exported = store.export_data().unwrap();
        assert!(exported.contains("\"version\": \"1.0.0\""));

        let (other, _) = setup();
        assert!(other.import_data(&exported).await);
        assert_eq!(
            other.get_programs().await.unwrap(),
            store.get_programs().await.unwrap()
        );

        assert!(!other.import_data("[]").await);
        assert!(!other.import_data(r#"{"programs": {}}"#).await);
        assert!(!other.import_data(r#"{"programs": [{"id": 1}]}"#).await);
        assert_eq!(other.get_programs().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_storage_info_and_clear() {
        let (store, clock) = setup();
        let empty = store.storage_info().unwrap();
        assert_eq!(empty.total_programs, 0);
        assert_eq!(empty.last_modified, None);
        assert_eq!(empty.size_kb(), "0.00 KB");

        store.create_program(program("p1", vec![])).await.unwrap();
        clock.advance(chrono::Duration::minutes(5));
        store.create_program(program("p2", vec![])).await.unwrap();

        let info = store.storage_info().unwrap();
        assert_eq!(info.total_programs, 2);
        assert!(info.storage_size > 0);
        assert_eq!(info.last_modified, Some(clock.now()));

        store.clear_programs().await.unwrap();
        assert!(store.get_programs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let kv: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::open(dir.path()).unwrap());

        let store = LocalProgramStore::new(kv.clone(), clock.clone());
        store.create_program(program("p1", vec![])).await.unwrap();

        let reopened = LocalProgramStore::new(kv, clock);
        assert_eq!(reopened.get_programs().await.unwrap().len(), 1);
    }
}
