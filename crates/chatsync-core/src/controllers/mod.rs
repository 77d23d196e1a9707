pub mod generation_controller;

pub use generation_controller::{
    GenerationController, GenerationEvent, RegenerateOptions, SessionTicket,
};
