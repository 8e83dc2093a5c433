// Copyright 2020 Joyent, Inc.

use std::borrow::Cow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_derive::{Deserialize, Serialize};
use slog::{debug, o, Drain, Level, LevelFilter, Logger};

use atomic_jeri::error::{Error, Result};
use atomic_jeri::handler::InvocationHandler;
use atomic_jeri::loopback::LoopbackServer;
use atomic_jeri::security::Permission;
use atomic_jeri::string_constraints::StringMethodDesc;
use atomic_jeri::{
    AtomicILFactory, FactoryConfig, Interface, InvocationConstraint,
    InvocationConstraints, Loader, Method, Object, Proxy, Remote,
    RemoteException, Serializable, StringMethodConstraints,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
enum AccountKind {
    Checking,
    Savings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Account {
    owner: String,
    kind: AccountKind,
    balance: i64,
}

impl Serializable for Account {
    fn class_name() -> Cow<'static, str> {
        Cow::Borrowed("Account")
    }

    fn validate(&self) -> Result<()> {
        if self.owner.is_empty() {
            return Err(Error::InvalidObject(String::from("account has no owner")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Entry {
    amount: i64,
    memo: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Statement {
    account: Account,
    entries: Vec<Entry>,
}

impl Serializable for Statement {
    fn class_name() -> Cow<'static, str> {
        Cow::Borrowed("Statement")
    }

    fn validate(&self) -> Result<()> {
        self.account.validate()?;
        let total: i64 = self.entries.iter().map(|e| e.amount).sum();
        if total != self.account.balance {
            return Err(Error::InvalidObject(String::from(
                "entries do not add up to the balance",
            )));
        }
        Ok(())
    }
}

fn open() -> Method {
    Method::new("Bank", "open", &["String"], "Account")
}

fn statement() -> Method {
    Method::new("Bank", "statement", &["Account"], "Statement")
}

fn deposit() -> Method {
    Method::new("Bank", "deposit", &["i64"], "i64")
}

fn total() -> Method {
    Method::new("Bank", "total", &["[i64]"], "i64")
}

fn broken() -> Method {
    Method::new("Bank", "broken", &[], "i64")
}

struct Bank {
    loader: Loader,
    balance: Mutex<i64>,
    calls: AtomicUsize,
    log: Logger,
}

impl Bank {
    fn new(log: &Logger) -> Bank {
        Bank {
            loader: Loader::builder("bank")
                .register::<Account>()
                .register::<Statement>()
                .build(),
            balance: Mutex::new(0),
            calls: AtomicUsize::new(0),
            log: log.new(o!("remote" => "bank")),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn internal(e: Error) -> RemoteException {
    RemoteException::new("InternalError", &e.to_string())
}

impl Remote for Bank {
    fn interfaces(&self) -> Vec<Interface> {
        vec![Interface::new(
            "Bank",
            vec![open(), statement(), deposit(), total(), broken()],
        )]
    }

    fn invoke(
        &self,
        method: &Method,
        args: Vec<Object>,
    ) -> std::result::Result<Object, RemoteException> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        debug!(self.log, "invoked"; "method" => method.name());

        match method.name() {
            "open" => {
                let owner: String = args[0].decode().map_err(internal)?;
                let account = Account {
                    owner,
                    kind: AccountKind::Savings,
                    balance: 0,
                };
                Object::new(&account).map_err(internal)
            }
            "statement" => {
                let mut account: Account = args[0].decode().map_err(internal)?;
                account.balance = 30;
                let entries = vec![
                    Entry {
                        amount: 50,
                        memo: String::from("salary"),
                    },
                    Entry {
                        amount: -20,
                        memo: String::from("rent"),
                    },
                ];
                Object::new(&Statement { account, entries }).map_err(internal)
            }
            "deposit" => {
                let amount: i64 = args[0].decode().map_err(internal)?;
                if amount <= 0 {
                    return Err(RemoteException::new(
                        "IllegalAmount",
                        &format!("cannot deposit {}", amount),
                    ));
                }
                let mut balance = self.balance.lock().unwrap();
                *balance += amount;
                Object::new(&*balance).map_err(internal)
            }
            "total" => {
                let amounts: Vec<i64> = args[0].decode().map_err(internal)?;
                Object::new(&amounts.iter().sum::<i64>()).map_err(internal)
            }
            "broken" => Object::new(&String::from("not a number")).map_err(internal),
            name => Err(RemoteException::new("NoSuchMethod", name)),
        }
    }

    fn loader(&self) -> Option<Loader> {
        Some(self.loader.clone())
    }
}

fn test_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Info,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

fn export(
    server: &Arc<LoopbackServer>,
    factory: &AtomicILFactory,
    log: &Logger,
) -> (Arc<Bank>, Proxy) {
    let bank = Arc::new(Bank::new(log));
    let proxy = server.export(bank.clone(), factory).unwrap();
    (bank, proxy)
}

fn arg<T: Serializable>(value: T) -> Object {
    Object::new(&value).unwrap()
}

fn required(c: InvocationConstraint) -> InvocationConstraints {
    InvocationConstraints::required(vec![c])
}

#[test]
fn records_round_trip() {
    let log = test_logger();
    let server = LoopbackServer::new(Some(&log));
    let factory = AtomicILFactory::new(None, None, None, Some(&log));
    let (bank, proxy) = export(&server, &factory, &log);

    let account: Account = proxy
        .call(&open(), &[arg(String::from("ann"))])
        .unwrap();
    assert_eq!(
        account,
        Account {
            owner: String::from("ann"),
            kind: AccountKind::Savings,
            balance: 0,
        }
    );

    let st: Statement = proxy.call(&statement(), &[arg(account.clone())]).unwrap();
    assert_eq!(st.account.owner, "ann");
    assert_eq!(st.entries.len(), 2);
    assert_eq!(st.entries[1].memo, "rent");

    let sum: i64 = proxy.call(&total(), &[arg(vec![1i64, 2, 3, 4])]).unwrap();
    assert_eq!(sum, 10);

    assert_eq!(bank.calls(), 3);
}

#[test]
fn argument_class_mismatch_rejected_by_server() {
    let log = test_logger();
    let server = LoopbackServer::new(Some(&log));
    let factory = AtomicILFactory::new(None, None, None, Some(&log));
    let (bank, proxy) = export(&server, &factory, &log);

    let nobody = Account {
        owner: String::new(),
        kind: AccountKind::Checking,
        balance: 0,
    };
    assert!(matches!(Object::new(&nobody), Err(Error::InvalidObject(_))));

    let res = proxy.invoke(&statement(), &[arg(String::from("ann"))]);
    assert!(matches!(res, Err(Error::Server(_))));
    assert_eq!(bank.calls(), 0);
}

#[test]
fn application_exception_kept_apart_from_failure() {
    let log = test_logger();
    let server = LoopbackServer::new(Some(&log));
    let factory = AtomicILFactory::new(None, None, None, Some(&log));
    let (bank, proxy) = export(&server, &factory, &log);

    match proxy.invoke(&deposit(), &[arg(-5i64)]) {
        Err(Error::Application(e)) => assert_eq!(e.kind, "IllegalAmount"),
        other => panic!("unexpected result {:?}", other),
    }
    let balance: i64 = proxy.call(&deposit(), &[arg(5i64)]).unwrap();
    assert_eq!(balance, 5);

    match proxy.invoke(&broken(), &[]) {
        Err(Error::Server(e)) => assert_eq!(e.kind, "UnmarshalException"),
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(bank.calls(), 3);
}

#[test]
fn concurrent_calls_on_one_export() {
    const THREADS: i64 = 8;

    let log = test_logger();
    let server = LoopbackServer::new(Some(&log));
    let factory = AtomicILFactory::new(None, None, None, Some(&log));
    let (bank, proxy) = export(&server, &factory, &log);

    std::thread::scope(|s| {
        for amount in 1..=THREADS {
            let proxy = &proxy;
            s.spawn(move || {
                let balance: i64 = proxy.call(&deposit(), &[arg(amount)]).unwrap();
                assert!(balance >= amount);
            });
        }
    });

    assert_eq!(*bank.balance.lock().unwrap(), THREADS * (THREADS + 1) / 2);
    assert_eq!(bank.calls(), THREADS as usize);
}

struct Pinger {
    calls: AtomicUsize,
}

fn ping(declaring: &str) -> Method {
    Method::new(declaring, "ping", &[], "bool")
}

impl Remote for Pinger {
    fn interfaces(&self) -> Vec<Interface> {
        vec![
            Interface::new("Health", vec![ping("Health")]),
            Interface::new("Admin", vec![ping("Admin")]),
        ]
    }

    fn invoke(
        &self,
        method: &Method,
        _args: Vec<Object>,
    ) -> std::result::Result<Object, RemoteException> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Object::new(&(method.name() == "ping")).map_err(internal)
    }
}

#[test]
fn method_shared_by_two_interfaces() {
    let log = test_logger();
    let server = LoopbackServer::new(Some(&log));
    let factory = AtomicILFactory::new(None, None, None, Some(&log));
    let pinger = Arc::new(Pinger {
        calls: AtomicUsize::new(0),
    });
    let proxy = server.export(pinger.clone(), &factory).unwrap();

    assert!(proxy.call::<bool>(&ping("Health"), &[]).unwrap());
    assert!(proxy.call::<bool>(&ping("Admin"), &[]).unwrap());
    assert_eq!(pinger.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn integrity_required_by_server() {
    let log = test_logger();
    let server = LoopbackServer::new(Some(&log));
    let sc = StringMethodConstraints::new(vec![
        StringMethodDesc::new(
            Some("deposit"),
            None,
            required(InvocationConstraint::Integrity(true)),
        )
        .unwrap(),
        StringMethodDesc::default_rule(InvocationConstraints::EMPTY),
    ])
    .unwrap();
    let factory = AtomicILFactory::new(Some(sc), None, None, Some(&log));
    let (_, proxy) = export(&server, &factory, &log);

    let balance: i64 = proxy.call(&deposit(), &[arg(7i64)]).unwrap();
    assert_eq!(balance, 7);
    let _: Account = proxy.call(&open(), &[arg(String::from("bo"))]).unwrap();
}

#[test]
fn unsupported_constraints() {
    let log = test_logger();
    let server = LoopbackServer::new(Some(&log));
    let factory = AtomicILFactory::new(None, None, None, Some(&log));
    let (bank, proxy) = export(&server, &factory, &log);

    let strict = proxy.set_constraints(Some(StringMethodConstraints::uniform(required(
        InvocationConstraint::ClientAuthentication(true),
    ))));
    assert_eq!(strict, proxy);
    assert!(!strict.check_trust_equivalence(&proxy));
    let res = strict.invoke(&deposit(), &[arg(1i64)]);
    assert!(matches!(res, Err(Error::UnsupportedConstraint(_))));
    assert_eq!(bank.calls(), 0);

    let principal = InvocationConstraint::ServerMinPrincipal(
        vec![String::from("bank")].into_iter().collect(),
    );
    let picky = AtomicILFactory::new(
        Some(StringMethodConstraints::uniform(required(principal))),
        None,
        None,
        Some(&log),
    );
    let res = server.export(Arc::new(Bank::new(&log)), &picky);
    assert!(matches!(res, Err(Error::Export(_))));
}

#[test]
fn access_checked_for_each_call() {
    let log = test_logger();
    let granted = vec![Permission::for_method(&open())];
    let server = LoopbackServer::with_client_permissions(granted, Some(&log));
    let factory =
        AtomicILFactory::new(None, Some(Permission::for_method), None, Some(&log));
    let (bank, proxy) = export(&server, &factory, &log);

    let _: Account = proxy.call(&open(), &[arg(String::from("cy"))]).unwrap();
    match proxy.invoke(&deposit(), &[arg(1i64)]) {
        Err(Error::Server(e)) => assert_eq!(e.kind, "AccessControlException"),
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(bank.calls(), 1);
}

#[test]
fn unexported_object_is_gone() {
    let log = test_logger();
    let server = LoopbackServer::new(Some(&log));
    let factory = AtomicILFactory::new(None, None, None, Some(&log));
    let (_, proxy) = export(&server, &factory, &log);

    let _: i64 = proxy.call(&deposit(), &[arg(1i64)]).unwrap();
    let id = *proxy.handler().object_endpoint().id();
    assert!(server.unexport(&id));
    assert!(matches!(
        proxy.invoke(&deposit(), &[arg(1i64)]),
        Err(Error::NoSuchObject)
    ));
}

#[test]
fn factory_from_config() {
    let log = test_logger();
    let config = FactoryConfig::from_json(
        r#"{
            "server_constraints": [
                { "name": "deposit", "types": ["i64"],
                  "constraints": { "requirements": [{ "Integrity": true }] } },
                { "name": "*t", "constraints": { "preferences": [{ "Confidentiality": true }] } },
                { "constraints": {} }
            ],
            "check_access": true
        }"#,
    )
    .unwrap();
    let factory = AtomicILFactory::from_config(config, None, Some(&log));

    let granted = vec![
        Permission::for_method(&deposit()),
        Permission::for_method(&total()),
    ];
    let server = LoopbackServer::with_client_permissions(granted, Some(&log));
    let (_, proxy) = export(&server, &factory, &log);

    let c = proxy.handler().call_constraints(&deposit());
    assert!(c.requires(&InvocationConstraint::Integrity(true)));
    let c = proxy.handler().call_constraints(&total());
    assert!(c.prefers(&InvocationConstraint::Confidentiality(true)));

    let balance: i64 = proxy.call(&deposit(), &[arg(3i64)]).unwrap();
    assert_eq!(balance, 3);
    let sum: i64 = proxy.call(&total(), &[arg(vec![3i64, 4])]).unwrap();
    assert_eq!(sum, 7);
    assert!(matches!(
        proxy.invoke(&open(), &[arg(String::from("dee"))]),
        Err(Error::Server(_))
    ));
}
