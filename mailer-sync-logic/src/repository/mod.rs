pub mod clients;
pub mod conflicts;
pub mod crosswalk;
pub mod locks;
pub mod shadows;
pub mod sync_log;
pub mod sync_state;
