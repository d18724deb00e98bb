pub mod character;
pub mod configuration;
pub mod esi_client;
pub mod market_cache;
pub mod pagination;
pub mod reqwest_helpers;
pub mod route_calculator;
pub mod universe;

#[cfg(test)]
pub mod test_objects;
