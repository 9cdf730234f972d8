//! Core utilities shared by the resolution strategies.

pub mod analysis;
pub mod client;
pub mod http;
pub mod types;

pub use analysis::{
    decode_base64, decode_base64_link, extract_links, first_link, is_valid_candidate,
    json_link, origin_from_url, percent_decode, resolve_candidate, same_host,
};
pub use client::{ReqwestPageFetcher, ReqwestSession};
pub use self::http::{FetchError, FetchedPage, PageFetcher, PageRequest};
pub use types::{AttemptRecord, ResolutionResult, ResolutionStatus, StrategyDescriptor};
