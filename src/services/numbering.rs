use crate::entities::number_sequence::{self, Entity as NumberSequenceEntity};
use crate::errors::ServiceError;
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};
use tracing::error;

/// Document number sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequence {
    SalesOrder,
    Invoice,
}

impl Sequence {
    pub fn key(self) -> &'static str {
        match self {
            Sequence::SalesOrder => "sales_order",
            Sequence::Invoice => "invoice",
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            Sequence::SalesOrder => "SO",
            Sequence::Invoice => "INV",
        }
    }

    pub fn format(self, value: i64) -> String {
        format!("{}-{:06}", self.prefix(), value)
    }
}

/// Allocates the next number of `sequence` on `conn`.
///
/// Run this on the transaction that inserts the document: the increment
/// holds the row lock until commit, so concurrent creators are serialized
/// and a rollback gives the number back.
pub async fn next_number<C>(conn: &C, sequence: Sequence) -> Result<String, ServiceError>
where
    C: ConnectionTrait,
{
    let bumped = NumberSequenceEntity::update_many()
        .col_expr(
            number_sequence::Column::CurrentValue,
            Expr::col(number_sequence::Column::CurrentValue).add(1),
        )
        .filter(number_sequence::Column::Name.eq(sequence.key()))
        .exec(conn)
        .await
        .map_err(|e| {
            error!(error = %e, sequence = sequence.key(), "Failed to advance number sequence");
            ServiceError::DatabaseError(e)
        })?;

    if bumped.rows_affected == 0 {
        number_sequence::ActiveModel {
            name: Set(sequence.key().to_string()),
            current_value: Set(1),
        }
        .insert(conn)
        .await?;
        return Ok(sequence.format(1));
    }

    let row = NumberSequenceEntity::find_by_id(sequence.key().to_string())
        .one(conn)
        .await?
        .ok_or_else(|| {
            ServiceError::InternalError(format!("number sequence {} vanished", sequence.key()))
        })?;

    Ok(sequence.format(row.current_value))
}
