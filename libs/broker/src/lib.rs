mod config;
mod error;
mod http;
mod price_client;
mod session;

pub mod indicators;
pub mod symbol;

pub use config::BrokerConfig;
pub use error::{BrokerError, Result};
pub use http::{HttpBody, HttpMethod, HttpRequest, HttpResponse, ReqwestTransport, Transport};
pub use indicators::dma::{Dma20, DmaCalculator, Method};
pub use price_client::{ApiVariant, Bar, HistoricalSeries, PriceClient, Quote};
pub use session::{
    ApiCredentials, Clock, LoginOutcome, SESSION_DURATION, Session, SessionManager,
    SessionOutcome, SessionStatus, SessionStore, SystemClock,
};
