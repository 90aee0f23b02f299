//! Message model and addressing shared by all transports
//!
//! Envelope types, the operation vocabulary, the brokered address grammar
//! and Thing Description forms.

pub mod address;
pub mod forms;
pub mod messages;
pub mod operations;

pub use address::{agent_of, Address, AddressTokens};
pub use forms::{Form, FormProvider, TdFormStore};
pub use messages::*;
pub use operations::*;
