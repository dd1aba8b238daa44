pub mod database;
pub mod device;
pub mod layout;
pub mod provides;
pub mod settings;
pub mod state_data;
