use crate::{
    db::DbPool,
    entities::customer::{self, Entity as CustomerEntity, Model as CustomerModel},
    errors::ServiceError,
    services::{normalize_paging, Page, PageMeta},
};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateCustomerRequest {
    #[validate(length(min = 1, max = 255, message = "Name is required"))]
    pub name: String,
    #[validate(email(message = "A valid email is required"))]
    pub email: String,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, ToSchema)]
pub struct UpdateCustomerRequest {
    #[validate(length(min = 1, max = 255, message = "Name is required"))]
    pub name: Option<String>,
    #[validate(email(message = "A valid email is required"))]
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CustomerQuery {
    pub page: Option<u64>,
    pub limit: Option<u64>,
    /// Matches name, email or company.
    pub search: Option<String>,
}

/// Customer records used by the order pipeline.
#[derive(Clone)]
pub struct CustomerService {
    db_pool: Arc<DbPool>,
}

impl CustomerService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    #[instrument(skip(self, request), fields(email = %request.email))]
    pub async fn create(&self, request: CreateCustomerRequest) -> Result<CustomerModel, ServiceError> {
        request.validate()?;
        let db = &*self.db_pool;

        let taken = CustomerEntity::find()
            .filter(customer::Column::Email.eq(request.email.clone()))
            .one(db)
            .await?;
        if taken.is_some() {
            return Err(ServiceError::Conflict(format!(
                "Customer with email {} already exists",
                request.email
            )));
        }

        let model = customer::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(request.name),
            email: Set(request.email),
            phone: Set(request.phone),
            company: Set(request.company),
            address: Set(request.address),
            ..Default::default()
        }
        .insert(db)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to create customer");
            ServiceError::DatabaseError(e)
        })?;

        info!(customer_id = %model.id, "Customer created");
        Ok(model)
    }

    /// Newest first.
    #[instrument(skip(self))]
    pub async fn find_all(&self, query: CustomerQuery) -> Result<Page<CustomerModel>, ServiceError> {
        let (page, limit) = normalize_paging(query.page, query.limit);

        let mut select = CustomerEntity::find();
        if let Some(term) = query.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            select = select.filter(
                Condition::any()
                    .add(customer::Column::Name.contains(term))
                    .add(customer::Column::Email.contains(term))
                    .add(customer::Column::Company.contains(term)),
            );
        }

        let paginator = select
            .order_by_desc(customer::Column::CreatedAt)
            .paginate(&*self.db_pool, limit);
        let total = paginator.num_items().await.map_err(|e| {
            error!(error = %e, "Failed to count customers");
            ServiceError::DatabaseError(e)
        })?;
        let data = paginator.fetch_page(page - 1).await?;

        Ok(Page {
            data,
            meta: PageMeta::new(total, page, limit),
        })
    }

    #[instrument(skip(self, request), fields(customer_id = %id))]
    pub async fn update(
        &self,
        id: Uuid,
        request: UpdateCustomerRequest,
    ) -> Result<CustomerModel, ServiceError> {
        request.validate()?;
        let db = &*self.db_pool;
        let existing = self.find_by_id(id).await?;

        if let Some(email) = request.email.as_ref().filter(|e| **e != existing.email) {
            let taken = CustomerEntity::find()
                .filter(customer::Column::Email.eq(email.clone()))
                .one(db)
                .await?;
            if taken.is_some() {
                return Err(ServiceError::Conflict(format!(
                    "Customer with email {} already exists",
                    email
                )));
            }
        }

        let mut active: customer::ActiveModel = existing.into();
        if let Some(name) = request.name {
            active.name = Set(name);
        }
        if let Some(email) = request.email {
            active.email = Set(email);
        }
        if let Some(phone) = request.phone {
            active.phone = Set(Some(phone));
        }
        if let Some(company) = request.company {
            active.company = Set(Some(company));
        }
        if let Some(address) = request.address {
            active.address = Set(Some(address));
        }

        let model = active.update(db).await.map_err(|e| {
            error!(error = %e, "Failed to update customer");
            ServiceError::DatabaseError(e)
        })?;
        info!("Customer updated");
        Ok(model)
    }

    #[instrument(skip(self))]
    pub async fn find_by_id(&self, id: Uuid) -> Result<CustomerModel, ServiceError> {
        CustomerEntity::find_by_id(id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Customer {} not found", id)))
    }
}
