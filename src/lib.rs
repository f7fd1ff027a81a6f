pub mod bus;
pub mod config;
pub mod db;
pub mod engine;
pub mod models;
pub mod presence;
pub mod rate_limit;
pub mod retention;
pub mod routes;
pub mod session;

use std::sync::Arc;

use bus::Bus;
use config::ChatConfig;
use db::Db;
use engine::Engine;
use presence::Presence;
use rocket_cors::{AllowedOrigins, CorsOptions};

/// Build from the environment, connecting to the configured bus. Exits the
/// process when the bus is unreachable; nothing works without it.
pub async fn rocket_from_env() -> rocket::Rocket<rocket::Build> {
    let cfg = ChatConfig::from_env();
    let bus = match Bus::connect(&cfg.bus_dsn).await {
        Ok(bus) => bus,
        Err(e) => {
            eprintln!("❌ Failed to connect to bus at {}: {e}", cfg.bus_dsn);
            std::process::exit(1);
        }
    };
    rocket_with_state(cfg, bus)
}

pub fn rocket_with_state(cfg: ChatConfig, bus: Bus) -> rocket::Rocket<rocket::Build> {
    // Ensure data directory exists
    if let Some(parent) = std::path::Path::new(&cfg.db_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let db = Db::new(&cfg.db_path);
    let bus = Arc::new(bus);
    let engine = Engine::new(bus.clone(), &cfg);
    let presence = Presence::new(bus.clone(), cfg.presence_ttl);

    let cors = if cfg.allowed_origins.is_empty() {
        CorsOptions::default()
    } else {
        let origins: Vec<&str> = cfg.allowed_origins.iter().map(String::as_str).collect();
        CorsOptions::default().allowed_origins(AllowedOrigins::some_exact(&origins))
    }
    .to_cors()
    .expect("Failed to create CORS");

    let bootstrap_bus = bus.clone();
    let bootstrap_db_path = cfg.db_path.clone();
    let reaper_bus = bus.clone();
    let reaper_engine = engine.clone();
    let reaper_db_path = cfg.db_path.clone();
    let reaper_stale_after = cfg.stale_after;
    let reaper_period = cfg.reaper_period;
    let retention_db_path = cfg.db_path.clone();

    rocket::build()
        .manage(db)
        .manage(bus)
        .manage(engine)
        .manage(presence)
        .manage(cfg)
        .attach(cors)
        .register(
            "/",
            rocket::catchers![routes::not_found, routes::unauthorized],
        )
        .mount(
            "/",
            rocket::routes![
                routes::health,
                routes::stats,
                routes::list_rooms,
                routes::get_room,
                routes::register_user,
                routes::lock_room,
                routes::get_messages,
                routes::chat_socket,
            ],
        )
        .attach(rocket::fairing::AdHoc::on_liftoff(
            "Presence Bootstrap",
            move |_rocket| {
                Box::pin(async move {
                    match Db::open(&bootstrap_db_path) {
                        Ok(db) => {
                            let online = presence::bootstrap_online(&bootstrap_bus, &db).await;
                            println!("🔄 Presence bootstrap: {online} users online");
                        }
                        Err(e) => eprintln!("⚠️  Presence bootstrap: failed to open DB: {e}"),
                    }
                })
            },
        ))
        .attach(rocket::fairing::AdHoc::on_liftoff(
            "Presence Reaper",
            move |_rocket| {
                Box::pin(async move {
                    presence::spawn_reaper(
                        reaper_bus,
                        reaper_engine,
                        reaper_db_path,
                        reaper_stale_after,
                        reaper_period,
                    );
                    println!("🧹 Presence reaper started");
                })
            },
        ))
        .attach(rocket::fairing::AdHoc::on_liftoff(
            "Message Retention",
            move |_rocket| {
                Box::pin(async move {
                    retention::spawn_retention_task(retention_db_path);
                    println!("🗄️  Message retention task started");
                })
            },
        ))
}
