#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::Duration as ChronoDuration;
use erp_fulfillment::{
    auth::{AuthService, Role},
    config::AppConfig,
    db,
    entities::{customer::Model as CustomerModel, product::Model as ProductModel},
    events::{self, EventSender},
    handlers::AppServices,
    message_queue::{JobWorker, WorkerOptions},
    services::{
        customers::CreateCustomerRequest,
        mail::{MailError, MailService, MailTransport, OutgoingMail},
        orders::{CreateOrderRequest, OrderDetail, OrderItemInput},
        products::CreateProductRequest,
    },
    AppState,
};
use rust_decimal::Decimal;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const TEST_JWT_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";
pub const ADMIN_USER: &str = "admin-user";
pub const STAFF_USER: &str = "staff-user";

/// Mail transport that keeps every delivered message, or refuses them all.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<OutgoingMail>>,
    pub fail: bool,
}

impl RecordingTransport {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn subjects(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.subject.clone())
            .collect()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn deliver(&self, mail: &OutgoingMail) -> Result<String, MailError> {
        if self.fail {
            return Err(MailError::Transport("smtp unavailable".into()));
        }
        self.sent.lock().unwrap().push(mail.clone());
        Ok(format!("<{}@test>", Uuid::new_v4()))
    }
}

/// Application wired against a throwaway SQLite file.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub mail: Arc<RecordingTransport>,
    admin_token: String,
    staff_token: String,
    _db_dir: TempDir,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_transport(RecordingTransport::default()).await
    }

    pub async fn with_transport(transport: RecordingTransport) -> Self {
        let db_dir = tempfile::tempdir().expect("create temp dir");
        let db_path = db_dir.path().join("erp_test.db");

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            TEST_JWT_SECRET.to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.auto_migrate = true;
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.scheduler_enabled = false;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db_arc = Arc::new(pool);

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let event_task = tokio::spawn(events::process_events(event_rx));

        let transport = Arc::new(transport);
        let mail = Arc::new(MailService::new(transport.clone(), cfg.mail_from.clone()));
        let auth = Arc::new(AuthService::new(&cfg.jwt_secret));
        let services = AppServices::new(db_arc.clone(), event_sender.clone(), mail);

        let admin_token = auth
            .issue_token(ADMIN_USER, Role::Admin, ChronoDuration::hours(1))
            .expect("issue admin token");
        let staff_token = auth
            .issue_token(STAFF_USER, Role::Staff, ChronoDuration::hours(1))
            .expect("issue staff token");

        let state = AppState {
            db: db_arc,
            config: cfg,
            event_sender,
            services,
            auth,
        };
        let router = erp_fulfillment::app_router(state.clone());

        Self {
            router,
            state,
            mail: transport,
            admin_token,
            staff_token,
            _db_dir: db_dir,
            _event_task: event_task,
        }
    }

    pub fn admin_token(&self) -> &str {
        &self.admin_token
    }

    pub fn staff_token(&self) -> &str {
        &self.staff_token
    }

    /// Sends a request and returns the status with the parsed JSON body
    /// (`Value::Null` for empty bodies).
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).expect("serialize request body"))
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).expect("build request"))
            .await
            .expect("router error during test request");

        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read response body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("parse response body")
        };
        (status, value)
    }

    pub async fn as_admin(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        self.request(method, uri, body, Some(self.admin_token())).await
    }

    pub async fn as_staff(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        self.request(method, uri, body, Some(self.staff_token())).await
    }

    pub async fn seed_product(&self, sku: &str, price: Decimal, stock: i32) -> ProductModel {
        self.seed_product_with_threshold(sku, price, stock, 10).await
    }

    pub async fn seed_product_with_threshold(
        &self,
        sku: &str,
        price: Decimal,
        stock: i32,
        threshold: i32,
    ) -> ProductModel {
        self.state
            .services
            .products
            .create(CreateProductRequest {
                sku: sku.to_string(),
                name: format!("Product {}", sku),
                description: None,
                price,
                cost: None,
                stock_quantity: Some(stock),
                low_stock_threshold: Some(threshold),
            })
            .await
            .expect("seed product")
    }

    pub async fn seed_customer(&self, email: &str) -> CustomerModel {
        self.state
            .services
            .customers
            .create(CreateCustomerRequest {
                name: "Acme Buyer".to_string(),
                email: email.to_string(),
                phone: None,
                company: Some("Acme".to_string()),
                address: None,
            })
            .await
            .expect("seed customer")
    }

    /// Creates a DRAFT order through the service layer.
    pub async fn create_order(
        &self,
        customer_id: Uuid,
        lines: &[(Uuid, i32)],
        tax_rate: Decimal,
    ) -> OrderDetail {
        self.state
            .services
            .orders
            .create(
                ADMIN_USER,
                CreateOrderRequest {
                    customer_id,
                    items: lines
                        .iter()
                        .map(|(product_id, quantity)| OrderItemInput {
                            product_id: *product_id,
                            quantity: *quantity,
                            discount: None,
                        })
                        .collect(),
                    tax_rate: Some(tax_rate),
                    discount: None,
                    notes: None,
                },
            )
            .await
            .expect("create order")
    }

    /// Runs one queued job in-process, as a worker would.
    pub async fn run_next_job(&self) -> bool {
        let services = &self.state.services;
        JobWorker::run_once(
            &services.order_queue,
            services.order_processor.as_ref(),
            &WorkerOptions::default(),
        )
        .await
        .expect("worker poll")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}
