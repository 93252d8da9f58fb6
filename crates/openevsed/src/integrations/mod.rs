#[cfg(feature = "integration_openevse")]
mod openevse;
