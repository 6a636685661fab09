pub mod commands;
pub mod config;
pub mod errors;
pub mod fields;
pub mod geocode;
pub mod loader;
pub mod pipeline;
pub mod query;
pub mod repair;
pub mod report;
pub mod store;
pub mod validator;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use commands::{migrate, repair_from_log, seed, RepairSummary, SeedOptions, SeedReport};
pub use config::{AppConfig, PublicAppConfig};
pub use errors::{AppError, AppResult, LoadError};
pub use fields::{resolve_fields, FieldMap};
pub use geocode::{Coordinate, CoordinateResolver, CoordinateSource, GeocodeFailure, Geocoder};
pub use loader::{load_table, RawRecord, Table};
pub use pipeline::{FailureRecord, Pipeline, RunOutcome, RunStats, ValidationOutcome};
pub use query::{ResolutionFailure, ResolutionMethod, ResolvedAddress};
pub use repair::{repair_failures, FailureCategory, RepairReport};
pub use report::{FailureLog, RunSummary};
pub use store::{open_store, PersistedRecord, UpsertSummary, WriteMode};
pub use validator::{AddressValidator, ValidationFailure, ValidationService};

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,smoking_area_seed=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
