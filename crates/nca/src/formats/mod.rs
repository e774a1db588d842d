pub mod nca;
