pub mod jwt;
pub mod middleware;
