//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Consumer side: turns delivered product events into notification emails.
//
// | Component                  | Description                                             |
// |----------------------------|---------------------------------------------------------|
// | Notifier                   | External collaborator sending an email                  |
// | LogNotifier                | Notifier writing emails to the log                      |
// | ProductNotificationHandler | DeliveryHandler for `product.created`                   |
//--------------------------------------------------------------------------------------------------

mod notifier;
mod product_handler;

pub use notifier::{Email, LogNotifier, Notifier, NotifyError};
pub use product_handler::{NEW_PRODUCT_SUBJECT, ProductNotificationHandler};
