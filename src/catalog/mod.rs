pub mod client;
pub mod config;
pub mod fetcher;

pub use client::{CatalogApi, CatalogError, HttpCatalog};
pub use fetcher::{FetchReport, FetchSettings, PaginatedFetcher};
