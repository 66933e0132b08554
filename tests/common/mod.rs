#![allow(dead_code, reason = "not every test binary uses every helper")]

pub mod clock;
pub mod mock_transport;

use std::sync::Arc;

use gcsfs::fs::GcsFileSystem;
use gcsfs::options::GcsFsOptions;
use gcsfs::storage::client::{ClientOptions, GcsClient};
use gcsfs::storage::retry::RetryOptions;
use gcsfs::storage::ObjectStore;

use mock_transport::MockTransport;

/// Retry options tuned so failure tests finish in milliseconds.
pub fn fast_retry() -> RetryOptions {
    RetryOptions {
        initial_delay_ms: 1,
        multiplier: 2.0,
        max_delay_ms: 5,
        max_attempts: 4,
    }
}

pub fn fast_client_options() -> ClientOptions {
    ClientOptions {
        retry: fast_retry(),
        ..ClientOptions::default()
    }
}

/// A typed client over a fresh mock transport, plus a handle to the mock.
pub fn mock_client() -> (GcsClient<MockTransport>, MockTransport) {
    let transport = MockTransport::new();
    let client = GcsClient::new(transport.clone(), fast_client_options());
    (client, transport)
}

/// A full facade stack over a mock transport with the given options.
pub fn mock_fs(options: GcsFsOptions) -> (GcsFileSystem, MockTransport) {
    let transport = MockTransport::new();
    let client = GcsClient::new(transport.clone(), fast_client_options());
    let store: Arc<dyn ObjectStore> = Arc::new(client);
    let fs = GcsFileSystem::with_store(store, options).unwrap();
    (fs, transport)
}

/// Default-option facade over a mock transport.
pub fn default_mock_fs() -> (GcsFileSystem, MockTransport) {
    let options = GcsFsOptions {
        retry: fast_retry(),
        ..GcsFsOptions::default()
    };
    mock_fs(options)
}
