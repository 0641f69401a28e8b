use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::Connection;

use crate::adapters::db::{open_connection, run_migrations};
use crate::app::services::{DirectoryCommandHandler, SqliteRentalService};
use crate::domain::models::{
    NewPowerBank, NewStation, NewUser, PowerBank, Station, StationId, TimestampMs, User,
    UserProfile,
};
use crate::domain::rental_state::Clock;

static TEST_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

const SEED_TIMESTAMP: TimestampMs = TimestampMs(1_700_000_000_000);

pub fn open_test_connection(test_name: &str) -> Connection {
    let template = ensure_template_db();
    let test_db_path = unique_test_db_path(test_name);

    if let Some(parent) = test_db_path.parent() {
        std::fs::create_dir_all(parent).expect("test db dir should be creatable");
    }

    std::fs::copy(&template, &test_db_path).expect("template db should be copied");
    open_connection(test_db_path.to_string_lossy().as_ref()).expect("test db should open")
}

pub fn open_test_service(test_name: &str) -> SqliteRentalService {
    SqliteRentalService::new(Arc::new(Mutex::new(open_test_connection(test_name))))
}

/// Clock whose time only moves when a test advances it. Clones share the time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now_ms: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: Arc::new(AtomicI64::new(now_ms)),
        }
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimestampMs {
        TimestampMs(self.now_ms.load(Ordering::SeqCst))
    }
}

pub fn seed_station(service: &SqliteRentalService, name: &str, capacity: u32) -> Station {
    service
        .create_station(&NewStation {
            name: name.to_string(),
            location: format!("{name} plaza"),
            capacity,
            created_at: SEED_TIMESTAMP,
        })
        .expect("station should be seeded")
}

pub fn seed_power_bank(
    service: &SqliteRentalService,
    station_id: StationId,
    serial_number: &str,
) -> PowerBank {
    service
        .create_power_bank(&NewPowerBank {
            station_id,
            serial_number: serial_number.to_string(),
            capacity_mah: Some(20_000),
            current_charge_mah: Some(15_000),
            created_at: SEED_TIMESTAMP,
        })
        .expect("power bank should be seeded")
}

pub fn seed_user(service: &SqliteRentalService, username: &str, balance_cents: i64) -> User {
    service
        .register_user(&NewUser {
            username: username.to_string(),
            email: format!("{username}@example.com"),
            balance_cents,
            is_admin: false,
            profile: UserProfile::default(),
            created_at: SEED_TIMESTAMP,
        })
        .expect("user should be seeded")
}

fn ensure_template_db() -> PathBuf {
    static TEMPLATE_PATH: OnceLock<PathBuf> = OnceLock::new();

    TEMPLATE_PATH
        .get_or_init(|| {
            let template_path = std::env::var("TEST_DB_TEMPLATE_PATH")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(default_template_path);

            if let Some(parent) = template_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).expect("template parent dir should be creatable");
            }

            let mut connection = open_connection(template_path.to_string_lossy().as_ref())
                .expect("template db opens");
            run_migrations(&mut connection).expect("template migrations should succeed");

            template_path
        })
        .clone()
}

fn default_template_path() -> PathBuf {
    if cfg!(windows) {
        Path::new(".\\data\\powerbank_test.db").to_path_buf()
    } else {
        Path::new("./data/powerbank_test.db").to_path_buf()
    }
}

fn unique_test_db_path(test_name: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let counter = TEST_DB_COUNTER.fetch_add(1, Ordering::Relaxed);
    Path::new("./target/testdb")
        .join(format!("{test_name}-{now}-{counter}.sqlite"))
        .to_path_buf()
}
