use once_cell::sync::Lazy;
use std::env;

pub static CATALOG_BASE_URL: Lazy<String> = Lazy::new(|| {
    env::var("CATALOG_BASE_URL")
        .unwrap_or_else(|_| "https://developers.cjdropshipping.com/api2.0/v1".to_string())
        .trim_end_matches('/')
        .to_string()
});

pub static CATALOG_ACCESS_TOKEN: Lazy<String> =
    Lazy::new(|| env::var("CATALOG_ACCESS_TOKEN").unwrap_or_default());

pub static PRODUCT_LIST_URL: Lazy<String> =
    Lazy::new(|| format!("{}/product/list", *CATALOG_BASE_URL));
