fn main() {
    let env = env_logger::Env::default()
        .filter_or("RTT_LOG_LEVEL", "info")
        .write_style_or("RTT_LOG_STYLE", "always");

    env_logger::init_from_env(env);

    if let Err(err) = app::run() {
        log::error!("app error: {err}");
    }
}
