//! Sea-ORM entities for rentsync-store

pub mod booking_requests;
pub mod conversation_participants;
pub mod conversations;
pub mod local_flags;
pub mod messages;
pub mod profiles;

pub use booking_requests::Entity as BookingRequests;
pub use conversation_participants::Entity as ConversationParticipants;
pub use conversations::Entity as Conversations;
pub use local_flags::Entity as LocalFlags;
pub use messages::Entity as Messages;
pub use profiles::Entity as Profiles;
