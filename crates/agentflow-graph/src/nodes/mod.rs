pub mod chat;
pub mod transform;
pub mod turn;

pub use chat::ChatTurn;
pub use transform::Transform;
pub use turn::Turn;
