//! Transaction feature engineering crate.
//!
//! Current implemented scope:
//! - transactions-to-features transform (rolling windows, window ratios,
//!   trailing z-score, cyclical time encodings, percentile amount flags)
//! - parquet/CSV transaction table loading and writing
//! - shared logging and deterministic seed initialization

mod features;
mod loader;
mod observability;

pub use features::{
    amount_percentile_flags, assert_schema_compatible, build_features, derived_schema,
    rolling_features, time_encodings, window_ratios, zscore_amount_7d, FeatureColumn,
    FeatureDType, FeatureError, FeatureSchema, RollingWindow, COL_AMOUNT, COL_DATE, COL_TYPE,
    COL_USER_ID, FEATURE_SCHEMA_VERSION, WINDOWS,
};
pub use loader::{load_transactions, write_features, LoadError};
pub use observability::{
    init_logging, log_app_start, logging_config_from_env, seeded_rng, LogFormat, LoggingConfig,
    LoggingInitError, DEFAULT_SEED,
};
