mod events;
mod selector;
mod waker;

pub use events::Events;
pub use selector::{revents_from_epoll, RegistrationState, Selector};
pub use waker::Waker;
