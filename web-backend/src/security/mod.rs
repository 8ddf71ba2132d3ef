// HTTP edge of the security pipeline: request adaptation, bearer tokens, headers
pub mod adapter;
pub mod headers;
pub mod jwt;
