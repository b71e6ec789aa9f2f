//! Salesforce REST adapter for the mediation layer.

pub mod client;
pub mod oauth;
pub mod soql;

pub use client::SalesforceGateway;
pub use oauth::OAuthRefresher;
