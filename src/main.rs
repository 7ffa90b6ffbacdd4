#![allow(clippy::clone_on_copy)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::module_inception)]

#![warn(clippy::imprecise_flops)]
#![warn(clippy::suboptimal_flops)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::cognitive_complexity)]
#![warn(clippy::float_cmp_const)]
#![warn(clippy::implicit_hasher)]
#![warn(clippy::implicit_saturating_sub)]
#![warn(clippy::large_types_passed_by_value)]
#![warn(clippy::manual_ok_or)]
#![warn(clippy::missing_const_for_fn)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::non_ascii_literal)]
#![warn(clippy::trivially_copy_pass_by_ref)]
#![warn(clippy::type_repetition_in_bounds)]
#![warn(clippy::unreadable_literal)]
#![warn(clippy::unseparated_literal_suffix)]
#![warn(clippy::unused_self)]

use actix_cors::Cors;
use actix_web::middleware::Logger;
use actix_web::{App, HttpServer};
#[cfg(feature = "ssl-secure")]
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};
use sqlx::PgPool;

mod core;
mod http;
mod lib;
mod ws;

use crate::core::state::AppState;
use crate::lib::config::Config;

async fn create_pool(config: &Config) -> PgPool {
    PgPool::new(&config.database_url)
        .await
        .unwrap_or_else(|err| panic!("could not connect to database: {}", err))
}

fn cors(origins: &[String]) -> Cors {
    let mut cors = Cors::new();
    for origin in origins {
        cors = if origin == "*" { cors.send_wildcard() } else { cors.allowed_origin(origin) };
    }
    cors.finish()
}

#[actix_rt::main]
async fn main() -> std::io::Result<()> {
    std::env::set_var("RUST_LOG", "actix_web=info");
    env_logger::init();

    let config = Config::load();
    #[cfg(feature = "graylog")]
    let _graylog = lib::log::init_graylog(&std::env::var("GRAYLOG_HOST").unwrap_or_else(|_| "localhost".into()), 1514);

    let db_pool = create_pool(&config).await;
    crate::core::state::init(AppState::new(db_pool, config));
    let state = crate::core::state::state();
    let listening_url = state.config.listening_url.clone();
    let cors_origins = state.config.cors_origins.clone();

    let mut server = HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(cors(&cors_origins))
            .configure(http::configure)
    });

    #[cfg(feature = "ssl-secure")]
    {
        let key = std::env::var("SSL_PRIVATE_KEY").unwrap_or_else(|_| "../var/ssl/key.pem".into());
        let cert = std::env::var("SSL_CERTIFICATE").unwrap_or_else(|_| "../var/ssl/cert.pem".into());

        let mut ssl_config = SslAcceptor::mozilla_intermediate(SslMethod::tls()).unwrap();
        ssl_config.set_private_key_file(key, SslFiletype::PEM).unwrap();
        ssl_config.set_certificate_chain_file(cert).unwrap();

        server = server.bind_openssl(&listening_url, ssl_config)?;
    }
    #[cfg(not(feature = "ssl-secure"))]
    {
        server = server.bind(&listening_url)?;
    }

    let result = server.run().await;
    state.shutdown().await;
    result
}
