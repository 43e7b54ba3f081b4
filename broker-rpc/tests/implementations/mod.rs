#![allow(dead_code)]

pub mod echo_worker;
pub mod silent_worker;

pub fn init_logger() {
    let _ = pretty_env_logger::formatted_builder()
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}
