pub mod api;

#[cfg(any(feature = "client", test))]
pub mod client;

#[cfg(any(feature = "server", test))]
pub mod app_config;

#[cfg(any(feature = "server", test))]
pub mod borrow_lifecycle;

#[cfg(any(feature = "server", test))]
pub mod errors;

#[cfg(any(feature = "server", test))]
mod handlers;

#[cfg(any(feature = "server", test))]
pub mod library_repository;

#[cfg(any(feature = "server", test))]
pub mod library_service;

#[cfg(any(feature = "server", test))]
pub mod session;

#[cfg(any(feature = "server", test))]
pub mod settings;
