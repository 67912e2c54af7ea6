//! # pvgate
//!
//! Gateway between a photovoltaic inverter on a Modbus RTU line and the local
//! network, with calendar-driven export limiting.
//!
//! ## Features
//!
//! - **Protocol bridge**: one register image served or mirrored across Modbus RTU and Modbus TCP
//! - **Time reconciliation**: network time with device-clock fallback, range checks and verification
//! - **Program evaluator**: static weekday/month calendar enforced on the active power limit register
//! - **Read-power monitor**: periodic active power poll published to the status stream
//! - **Configuration surface**: HTTP and control-port access to the persisted record
//!
//! ## Quick Start
//!
//! ```rust
//! use pvgate::agent::GatewayAgent;
//! use pvgate::clock::{ManualRtc, NoTimeSource};
//! use pvgate::config::{MemoryConfigStore, Tunables};
//! use pvgate::transport::SimulatedDevice;
//!
//! let bus = SimulatedDevice::inverter("inverter", 1_710_590_400);
//! let net = SimulatedDevice::new("peer");
//! let mut agent = GatewayAgent::new(
//!     Box::new(MemoryConfigStore::default()),
//!     Tunables::default(),
//!     bus,
//!     net,
//!     Box::new(ManualRtc::new(1_710_590_400)),
//!     Box::new(NoTimeSource),
//! );
//! agent.start(0).unwrap();
//! for tick in 0..100 {
//!     agent.step(tick * 10);
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`agent`] - control loop, bus arbitration and command handling
//! - [`bridge`] - dual-role transaction bridge over two [`transport`]s
//! - [`services`] - time, program and power state machines
//! - [`calendar`] - the static program table and its selection rule
//! - [`api`] / [`protocol`] - HTTP config surface and JSON-lines control port

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod agent;
pub mod api;
pub mod bridge;
pub mod calendar;
pub mod clock;
pub mod config;
pub mod fault;
pub mod ntp;
pub mod protocol;
pub mod registers;
pub mod scheduler;
pub mod services;
pub mod telemetry;
pub mod transaction;
pub mod transport;

pub use agent::GatewayAgent;
pub use bridge::ProtocolBridge;
pub use calendar::Calendar;
pub use config::{DeviceRole, PersistedConfig, Tunables};
pub use protocol::{Command, CommandResponse};
