//! # Cashflow Core
//!
//! Domain types and capability traits for the Cashflow payment system.
//!
//! ## Architecture
//!
//! ```text
//! HTTP ──► PaymentService ──► PaymentStore (payments + outbox, one tx)
//!                                   │
//!                          OutboxRelay (worker)
//!                                   │
//!                                   ▼
//!                           MessageTransport
//!                                   │
//!                       PaymentStatusConsumer (worker)
//!                                   │
//!                                   ▼
//!                 PaymentStore (row lock, terminal status)
//! ```
//!
//! Storage and messaging are traits so the worker and the API can run
//! against the in-memory implementations in tests.

pub mod config;
pub mod error;
pub mod memory;
pub mod memory_transport;
pub mod outbox;
pub mod payment;
pub mod service;
pub mod store;
pub mod transport;

pub use config::ConfigError;
pub use error::{PaymentError, StoreError};
pub use memory::{InMemoryPaymentStore, InMemoryTransaction};
pub use memory_transport::{InMemoryTransport, Settlement};
pub use outbox::{OutboxEvent, OutboxStatus};
pub use payment::{
    CreatePaymentRequest, CreatePaymentResponse, NewPayment, Payment, PaymentCurrency,
    PaymentDetailsResponse, PaymentStatus, MAX_AMOUNT_SCALE,
};
pub use service::PaymentService;
pub use store::{PaymentStore, StoreTransaction};
pub use transport::{Delivery, DeliveryStream, MessageTransport, StatusUpdateMessage, TransportError};
