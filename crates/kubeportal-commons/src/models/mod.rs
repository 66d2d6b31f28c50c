pub mod forward_model;
