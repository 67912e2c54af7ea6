//! Modbus workers behind [`ChannelTransport`](super::ChannelTransport).
//!
//! Framing, CRC, exception encoding and RS-485 direction control are handled
//! by `tokio-modbus` and `tokio-serial`; these tasks only translate between
//! the crate's transaction vocabulary and the Modbus client/server APIs.

use super::channel::{InboundRequest, WorkerCommand, WorkerEvent, WorkerHandle};
use crate::transaction::{
    values_from_slice, Completion, InboundException, InboundOp, InboundReply, RegisterOp,
    Request as TxRequest, Target, TxCode,
};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_modbus::prelude::*;
use tokio_modbus::server::tcp::accept_tcp_connection;
use tokio_modbus::server::Service;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub path: String,
    pub baud_rate: u32,
}

impl SerialSettings {
    fn open(&self) -> Result<SerialStream, tokio_serial::Error> {
        tokio_serial::new(&self.path, self.baud_rate).open_native_async()
    }
}

/// Completion plus whether the link underneath should be considered lost.
struct Executed {
    completion: Completion,
    link_lost: bool,
}

async fn execute(ctx: &mut client::Context, request: &TxRequest, timeout: Duration) -> Executed {
    if let Target::Bus { unit } = request.target {
        ctx.set_slave(Slave(unit));
    }
    let id = request.id;
    match &request.op {
        RegisterOp::Read { address, count } => {
            match tokio::time::timeout(timeout, ctx.read_holding_registers(*address, *count)).await {
                Err(_) => timed_out(id),
                Ok(Err(e)) => io_failure(id, &e),
                Ok(Ok(Err(exception))) => exception_failure(id, exception),
                Ok(Ok(Ok(words))) => Executed {
                    completion: values_from_slice(&words).map_or_else(
                        || Completion::failed(id, TxCode::RemoteError),
                        |values| Completion::success(id, values),
                    ),
                    link_lost: false,
                },
            }
        }
        RegisterOp::Write { address, values } => {
            match tokio::time::timeout(timeout, ctx.write_multiple_registers(*address, values)).await {
                Err(_) => timed_out(id),
                Ok(Err(e)) => io_failure(id, &e),
                Ok(Ok(Err(exception))) => exception_failure(id, exception),
                Ok(Ok(Ok(()))) => Executed {
                    completion: Completion::success(id, Default::default()),
                    link_lost: false,
                },
            }
        }
    }
}

fn timed_out(id: u16) -> Executed {
    Executed {
        completion: Completion::failed(id, TxCode::Timeout),
        link_lost: false,
    }
}

fn io_failure(id: u16, e: &tokio_modbus::Error) -> Executed {
    warn!("modbus transaction #{} failed: {}", id, e);
    Executed {
        completion: Completion::failed(id, TxCode::Timeout),
        link_lost: true,
    }
}

fn exception_failure(id: u16, exception: ExceptionCode) -> Executed {
    debug!("modbus transaction #{} answered {:?}", id, exception);
    let code = match exception {
        ExceptionCode::IllegalFunction => TxCode::NotSupported,
        _ => TxCode::RemoteError,
    };
    Executed {
        completion: Completion::failed(id, code),
        link_lost: false,
    }
}

/// Bus controller: one serial line, transactions executed one at a time.
pub fn spawn_rtu_client(
    settings: SerialSettings,
    unit: u8,
    mut handle: WorkerHandle,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ctx = match settings.open() {
            Ok(port) => {
                info!("RTU client on {} @ {} baud", settings.path, settings.baud_rate);
                Some(rtu::attach_slave(port, Slave(unit)))
            }
            Err(e) => {
                error!("cannot open {}: {}", settings.path, e);
                None
            }
        };
        while let Some(command) = handle.commands.recv().await {
            let WorkerCommand::Submit(request) = command else {
                continue;
            };
            let completion = match ctx.as_mut() {
                Some(ctx) => execute(ctx, &request, timeout).await.completion,
                None => Completion::failed(request.id, TxCode::Timeout),
            };
            handle.complete(completion);
        }
    })
}

/// Network client: at most one connection, to the endpoint of the last `Open`.
pub fn spawn_tcp_client(unit: u8, mut handle: WorkerHandle, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ctx: Option<client::Context> = None;
        while let Some(command) = handle.commands.recv().await {
            match command {
                WorkerCommand::Open(endpoint) => {
                    if let Some(mut old) = ctx.take() {
                        let _ = old.disconnect().await;
                    }
                    let attempt = tcp::connect_slave(endpoint, Slave(unit));
                    match tokio::time::timeout(CONNECT_TIMEOUT, attempt).await {
                        Ok(Ok(connected)) => {
                            ctx = Some(connected);
                            handle.notify(WorkerEvent::Connected(endpoint));
                        }
                        Ok(Err(e)) => handle.notify(WorkerEvent::ConnectFailed(endpoint, e.to_string())),
                        Err(_) => handle.notify(WorkerEvent::ConnectFailed(endpoint, "timed out".into())),
                    }
                }
                WorkerCommand::Close => {
                    if let Some(mut old) = ctx.take() {
                        let _ = old.disconnect().await;
                    }
                    handle.notify(WorkerEvent::Disconnected);
                }
                WorkerCommand::Submit(request) => {
                    let Some(connected) = ctx.as_mut() else {
                        handle.complete(Completion::failed(request.id, TxCode::Timeout));
                        continue;
                    };
                    let executed = execute(connected, &request, timeout).await;
                    if executed.link_lost {
                        ctx = None;
                        handle.notify(WorkerEvent::Disconnected);
                    }
                    handle.complete(executed.completion);
                }
            }
        }
    })
}

/// Forwards requests from a Modbus server to the control loop and waits for
/// the loop to answer them from the register image.
#[derive(Clone)]
struct ImageService {
    inbound: mpsc::UnboundedSender<InboundRequest>,
}

type ServiceFuture = Pin<Box<dyn Future<Output = Result<Response, ExceptionCode>> + Send>>;

fn refuse(exception: ExceptionCode) -> ServiceFuture {
    Box::pin(std::future::ready(Err(exception)))
}

impl Service for ImageService {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = ServiceFuture;

    fn call(&self, req: Self::Request) -> Self::Future {
        let mut single = None;
        let op = match req {
            Request::ReadHoldingRegisters(address, count) => InboundOp::Read { address, count },
            Request::WriteSingleRegister(address, value) => {
                single = Some(value);
                InboundOp::Write {
                    address,
                    values: values_from_slice(&[value]).unwrap_or_default(),
                }
            }
            Request::WriteMultipleRegisters(address, words) => match values_from_slice(&words) {
                Some(values) => InboundOp::Write { address, values },
                None => return refuse(ExceptionCode::IllegalDataValue),
            },
            _ => return refuse(ExceptionCode::IllegalFunction),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if self.inbound.send(InboundRequest { op, reply: reply_tx }).is_err() {
            return refuse(ExceptionCode::ServerDeviceFailure);
        }
        Box::pin(async move {
            match reply_rx.await {
                Ok(InboundReply::Registers(values)) => Ok(Response::ReadHoldingRegisters(values.to_vec())),
                Ok(InboundReply::Written { address, count }) => Ok(match single {
                    Some(value) => Response::WriteSingleRegister(address, value),
                    None => Response::WriteMultipleRegisters(address, count),
                }),
                Ok(InboundReply::Exception(exception)) => Err(match exception {
                    InboundException::IllegalFunction => ExceptionCode::IllegalFunction,
                    InboundException::IllegalDataAddress => ExceptionCode::IllegalDataAddress,
                    InboundException::IllegalDataValue => ExceptionCode::IllegalDataValue,
                }),
                Err(_) => Err(ExceptionCode::ServerDeviceFailure),
            }
        })
    }
}

/// Serial-line flavour: only requests addressed to our unit are answered.
/// Frames for other units on the shared line get no reply at all.
#[derive(Clone)]
struct UnitImageService {
    inner: ImageService,
    unit: u8,
}

type UnitServiceFuture = Pin<Box<dyn Future<Output = Result<Option<Response>, ExceptionCode>> + Send>>;

impl Service for UnitImageService {
    type Request = SlaveRequest<'static>;
    type Response = Option<Response>;
    type Exception = ExceptionCode;
    type Future = UnitServiceFuture;

    fn call(&self, req: Self::Request) -> Self::Future {
        if req.slave != self.unit {
            debug!("ignoring request for unit {}", req.slave);
            return Box::pin(std::future::ready(Ok(None)));
        }
        let answer = self.inner.call(req.request);
        Box::pin(async move { answer.await.map(Some) })
    }
}

/// Bus responder: answers the controller on the serial line from the image.
pub fn spawn_rtu_server(settings: SerialSettings, unit: u8, handle: WorkerHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let port = match settings.open() {
            Ok(port) => port,
            Err(e) => {
                error!("cannot open {}: {}", settings.path, e);
                return;
            }
        };
        info!("RTU responder unit {} on {}", unit, settings.path);
        let server = tokio_modbus::server::rtu::Server::new(port);
        let service = UnitImageService {
            inner: ImageService {
                inbound: handle.inbound.clone(),
            },
            unit,
        };
        if let Err(e) = server.serve_forever(service).await {
            error!("RTU responder stopped: {}", e);
        }
    })
}

/// Network server: answers remote controllers from the image.
pub fn spawn_tcp_server(bind: SocketAddr, handle: WorkerHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = serve_tcp(bind, handle.inbound.clone()).await {
            error!("Modbus TCP server on {} stopped: {}", bind, e);
        }
    })
}

async fn serve_tcp(bind: SocketAddr, inbound: mpsc::UnboundedSender<InboundRequest>) -> io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!("Modbus TCP server listening on {}", bind);
    let server = tokio_modbus::server::tcp::Server::new(listener);
    let service = ImageService { inbound };
    let on_connected = |stream: TcpStream, socket_addr: SocketAddr| {
        let service = service.clone();
        async move {
            debug!("Modbus TCP client {}", socket_addr);
            accept_tcp_connection(stream, socket_addr, move |_| Ok(Some(service.clone())))
        }
    };
    let on_process_error = |err| {
        warn!("Modbus TCP connection error: {}", err);
    };
    server.serve(&on_connected, on_process_error).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_service(unit: u8) -> (UnitImageService, mpsc::UnboundedReceiver<InboundRequest>) {
        let (inbound, requests) = mpsc::unbounded_channel();
        let service = UnitImageService {
            inner: ImageService { inbound },
            unit,
        };
        (service, requests)
    }

    #[tokio::test]
    async fn test_foreign_unit_gets_no_reply() {
        let (service, mut requests) = unit_service(3);
        let answer = service
            .call(SlaveRequest {
                slave: 4,
                request: Request::ReadHoldingRegisters(0, 1),
            })
            .await;
        assert_eq!(answer, Ok(None));
        assert!(requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_own_unit_answered_from_image() {
        let (service, mut requests) = unit_service(3);
        let pending = service.call(SlaveRequest {
            slave: 3,
            request: Request::ReadHoldingRegisters(10, 2),
        });

        let inbound = requests.try_recv().unwrap();
        assert_eq!(inbound.op, InboundOp::Read { address: 10, count: 2 });
        let values = values_from_slice(&[7, 8]).unwrap();
        inbound.reply.send(InboundReply::Registers(values)).unwrap();

        assert_eq!(pending.await, Ok(Some(Response::ReadHoldingRegisters(vec![7, 8]))));
    }

    #[tokio::test]
    async fn test_own_unit_exception_still_answered() {
        let (service, mut requests) = unit_service(3);
        let pending = service.call(SlaveRequest {
            slave: 3,
            request: Request::ReadHoldingRegisters(9_000, 1),
        });
        let inbound = requests.try_recv().unwrap();
        inbound
            .reply
            .send(InboundReply::Exception(InboundException::IllegalDataAddress))
            .unwrap();
        assert_eq!(pending.await, Err(ExceptionCode::IllegalDataAddress));
    }
}
