pub mod cron;
pub mod ldap_filter;
pub mod ldif;
