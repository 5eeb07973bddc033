//! Filter stages available to the configuration.

mod content;
mod lookup;
mod recipient;

pub use content::{AddReceivedHeader, RejectLargeMail, StopLoop};
pub use lookup::LookupDestination;
pub use recipient::{AcceptRecipient, ProhibitRelaying, RedirectPostmasterMail, RefuseUnknownRecipient};
