pub mod aggregator;
pub mod cds_client;
pub mod cell_cache;
pub mod error;
pub mod fetcher;
#[cfg(feature = "netcdf")]
pub mod netcdf_decode;
pub mod source;
