pub mod api_key;
pub mod audit;
pub mod backup;
pub mod ledger;
pub mod ldap_server;
pub mod restore;
pub mod schedule;
pub mod settings;
pub mod user;
