//! PostgreSQL-backed [`KycRepository`].
//!
//! Statuses are stored as their snake_case labels; the schema lives in
//! `migrations/` and is embedded at compile time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::error::ErrorKind;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use super::domain::{
    Applicant, ApplicantId, ApplicantProfile, ApplicantStatus, Document, DocumentType,
    ProviderReview, StepKind, StepSet, StepStatus, VerificationStep, WebhookEvent,
};
use super::repository::{KycRepository, RepositoryError};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const APPLICANT_COLUMNS: &str = "id, external_user_id, email, phone, first_name, last_name, \
     country, status, review_status, review_answer, reject_type, moderation_comment, \
     created_at, updated_at";

#[derive(Clone)]
pub struct PostgresKycRepository {
    pool: PgPool,
}

impl PostgresKycRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(database_error)?;
        Ok(Self::new(pool))
    }

    /// Apply pending embedded migrations, returning how many were available.
    pub async fn migrate(&self) -> Result<usize, RepositoryError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|err| RepositoryError::Unavailable(format!("migration failed: {err}")))?;
        Ok(MIGRATOR.iter().count())
    }

    async fn load_steps(&self, id: &ApplicantId) -> Result<StepSet, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT step, status, started_at, completed_at, error_message, updated_at
            FROM verification_steps
            WHERE applicant_id = $1
            "#,
        )
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(database_error)?;

        let steps = rows
            .iter()
            .map(parse_step_row)
            .collect::<Result<Vec<_>, _>>()?;
        StepSet::from_steps(steps).map_err(|err| RepositoryError::Corrupt(err.to_string()))
    }

    async fn hydrate(&self, row: Option<PgRow>) -> Result<Option<Applicant>, RepositoryError> {
        let Some(row) = row else {
            return Ok(None);
        };
        let id = ApplicantId(row.try_get("id").map_err(database_error)?);
        let steps = self.load_steps(&id).await?;
        parse_applicant_row(&row, id, steps).map(Some)
    }
}

#[async_trait]
impl KycRepository for PostgresKycRepository {
    async fn insert_applicant(&self, applicant: Applicant) -> Result<Applicant, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(database_error)?;

        sqlx::query(
            r#"
            INSERT INTO applicants (
                id, external_user_id, email, phone, first_name, last_name,
                country, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&applicant.id.0)
        .bind(&applicant.profile.external_user_id)
        .bind(&applicant.profile.email)
        .bind(&applicant.profile.phone)
        .bind(&applicant.profile.first_name)
        .bind(&applicant.profile.last_name)
        .bind(&applicant.profile.country)
        .bind(applicant.status.label())
        .bind(applicant.created_at)
        .bind(applicant.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(write_error)?;

        for step in applicant.steps.iter() {
            sqlx::query(
                r#"
                INSERT INTO verification_steps (
                    applicant_id, step, status, started_at, completed_at, error_message, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(&applicant.id.0)
            .bind(step.kind.label())
            .bind(step.status.label())
            .bind(step.started_at)
            .bind(step.completed_at)
            .bind(&step.error_message)
            .bind(step.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(write_error)?;
        }

        tx.commit().await.map_err(database_error)?;
        Ok(applicant)
    }

    async fn fetch_applicant(&self, id: &ApplicantId) -> Result<Option<Applicant>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {APPLICANT_COLUMNS} FROM applicants WHERE id = $1"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error)?;

        self.hydrate(row).await
    }

    async fn find_by_external_user_id(
        &self,
        external_user_id: &str,
    ) -> Result<Option<Applicant>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {APPLICANT_COLUMNS} FROM applicants WHERE external_user_id = $1"
        ))
        .bind(external_user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error)?;

        self.hydrate(row).await
    }

    async fn update_step(
        &self,
        id: &ApplicantId,
        step: &VerificationStep,
        expected: StepStatus,
    ) -> Result<(), RepositoryError> {
        let mut conn = self.pool.acquire().await.map_err(database_error)?;
        swap_step(&mut conn, id, step, expected).await
    }

    async fn record_upload(
        &self,
        id: &ApplicantId,
        step: &VerificationStep,
        expected: StepStatus,
        document: Document,
    ) -> Result<(), RepositoryError> {
        let size = i64::try_from(document.size_bytes)
            .map_err(|_| RepositoryError::Invalid("document size overflows BIGINT".to_string()))?;
        let mut tx = self.pool.begin().await.map_err(database_error)?;

        swap_step(&mut tx, id, step, expected).await?;

        sqlx::query(
            r#"
            INSERT INTO documents (
                applicant_id, document_type, file_name, mime_type, size_bytes,
                storage_ref, provider_document_id, uploaded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&document.applicant_id.0)
        .bind(document.document_type.label())
        .bind(&document.file_name)
        .bind(&document.mime_type)
        .bind(size)
        .bind(&document.storage_ref)
        .bind(&document.provider_document_id)
        .bind(document.uploaded_at)
        .execute(&mut *tx)
        .await
        .map_err(write_error)?;

        tx.commit().await.map_err(database_error)?;
        Ok(())
    }

    async fn update_applicant(
        &self,
        id: &ApplicantId,
        status: ApplicantStatus,
        review: Option<&ProviderReview>,
    ) -> Result<(), RepositoryError> {
        let query = match review {
            Some(review) => sqlx::query(
                r#"
                UPDATE applicants
                SET status = $2, review_status = $3, review_answer = $4, reject_type = $5,
                    moderation_comment = $6, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(&id.0)
            .bind(status.label())
            .bind(&review.review_status)
            .bind(&review.review_answer)
            .bind(&review.reject_type)
            .bind(&review.moderation_comment),
            None => sqlx::query("UPDATE applicants SET status = $2, updated_at = NOW() WHERE id = $1")
                .bind(&id.0)
                .bind(status.label()),
        };

        let result = query.execute(&self.pool).await.map_err(database_error)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn documents(&self, id: &ApplicantId) -> Result<Vec<Document>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT applicant_id, document_type, file_name, mime_type, size_bytes,
                   storage_ref, provider_document_id, uploaded_at
            FROM documents
            WHERE applicant_id = $1
            ORDER BY uploaded_at ASC, id ASC
            "#,
        )
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(database_error)?;

        rows.iter().map(parse_document_row).collect()
    }

    async fn insert_webhook_event(&self, event: WebhookEvent) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO webhook_events (
                applicant_id, event_type, review_status, review_answer, payload, received_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&event.applicant_id.0)
        .bind(&event.event_type)
        .bind(&event.review_status)
        .bind(&event.review_answer)
        .bind(&event.payload)
        .bind(event.received_at)
        .execute(&self.pool)
        .await
        .map_err(write_error)?;
        Ok(())
    }
}

/// Compare-and-swap one step row; a miss reports what is stored instead.
async fn swap_step(
    conn: &mut PgConnection,
    id: &ApplicantId,
    step: &VerificationStep,
    expected: StepStatus,
) -> Result<(), RepositoryError> {
    let result = sqlx::query(
        r#"
        UPDATE verification_steps
        SET status = $3, started_at = $4, completed_at = $5, error_message = $6, updated_at = $7
        WHERE applicant_id = $1 AND step = $2 AND status = $8
        "#,
    )
    .bind(&id.0)
    .bind(step.kind.label())
    .bind(step.status.label())
    .bind(step.started_at)
    .bind(step.completed_at)
    .bind(&step.error_message)
    .bind(step.updated_at)
    .bind(expected.label())
    .execute(&mut *conn)
    .await
    .map_err(write_error)?;

    if result.rows_affected() == 1 {
        return Ok(());
    }

    let current: Option<String> = sqlx::query_scalar(
        "SELECT status FROM verification_steps WHERE applicant_id = $1 AND step = $2",
    )
    .bind(&id.0)
    .bind(step.kind.label())
    .fetch_optional(&mut *conn)
    .await
    .map_err(database_error)?;

    match current {
        None => Err(RepositoryError::NotFound),
        Some(label) => Err(RepositoryError::StaleStep {
            step: step.kind,
            expected,
            actual: parse_label(&label, StepStatus::parse, "step status")?,
        }),
    }
}

fn database_error(err: sqlx::Error) -> RepositoryError {
    RepositoryError::Unavailable(err.to_string())
}

/// Class 22 (data exception) and 23 (integrity constraint) answers are
/// permanent; only the rest is worth retrying.
fn write_error(err: sqlx::Error) -> RepositoryError {
    let classified = err.as_database_error().and_then(|db| match db.kind() {
        ErrorKind::UniqueViolation => Some(RepositoryError::Conflict),
        ErrorKind::ForeignKeyViolation => Some(RepositoryError::NotFound),
        ErrorKind::NotNullViolation | ErrorKind::CheckViolation => {
            Some(RepositoryError::Invalid(db.message().to_string()))
        }
        _ => db
            .code()
            .filter(|code| is_permanent_sqlstate(code))
            .map(|_| RepositoryError::Invalid(db.message().to_string())),
    });
    classified.unwrap_or_else(|| database_error(err))
}

fn is_permanent_sqlstate(code: &str) -> bool {
    code.starts_with("22") || code.starts_with("23")
}

fn parse_label<T>(
    label: &str,
    parse: fn(&str) -> Option<T>,
    what: &str,
) -> Result<T, RepositoryError> {
    parse(label).ok_or_else(|| RepositoryError::Corrupt(format!("unknown {what} '{label}'")))
}

fn parse_step_row(row: &PgRow) -> Result<VerificationStep, RepositoryError> {
    let kind: String = row.try_get("step").map_err(database_error)?;
    let status: String = row.try_get("status").map_err(database_error)?;
    Ok(VerificationStep {
        kind: parse_label(&kind, StepKind::parse, "step kind")?,
        status: parse_label(&status, StepStatus::parse, "step status")?,
        started_at: row.try_get("started_at").map_err(database_error)?,
        completed_at: row.try_get("completed_at").map_err(database_error)?,
        error_message: row.try_get("error_message").map_err(database_error)?,
        updated_at: row.try_get("updated_at").map_err(database_error)?,
    })
}

fn parse_applicant_row(
    row: &PgRow,
    id: ApplicantId,
    steps: StepSet,
) -> Result<Applicant, RepositoryError> {
    let status: String = row.try_get("status").map_err(database_error)?;
    let review_status: Option<String> = row.try_get("review_status").map_err(database_error)?;
    let review = match review_status {
        Some(review_status) => Some(ProviderReview {
            review_status,
            review_answer: row.try_get("review_answer").map_err(database_error)?,
            reject_type: row.try_get("reject_type").map_err(database_error)?,
            moderation_comment: row.try_get("moderation_comment").map_err(database_error)?,
        }),
        None => None,
    };
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(database_error)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(database_error)?;

    Ok(Applicant {
        id,
        profile: ApplicantProfile {
            external_user_id: row.try_get("external_user_id").map_err(database_error)?,
            email: row.try_get("email").map_err(database_error)?,
            phone: row.try_get("phone").map_err(database_error)?,
            first_name: row.try_get("first_name").map_err(database_error)?,
            last_name: row.try_get("last_name").map_err(database_error)?,
            country: row.try_get("country").map_err(database_error)?,
        },
        status: parse_label(&status, ApplicantStatus::parse, "applicant status")?,
        steps,
        review,
        created_at,
        updated_at,
    })
}

fn parse_document_row(row: &PgRow) -> Result<Document, RepositoryError> {
    let document_type: String = row.try_get("document_type").map_err(database_error)?;
    let size: i64 = row.try_get("size_bytes").map_err(database_error)?;
    Ok(Document {
        applicant_id: ApplicantId(row.try_get("applicant_id").map_err(database_error)?),
        document_type: parse_label(&document_type, DocumentType::parse, "document type")?,
        file_name: row.try_get("file_name").map_err(database_error)?,
        mime_type: row.try_get("mime_type").map_err(database_error)?,
        size_bytes: u64::try_from(size)
            .map_err(|_| RepositoryError::Corrupt(format!("negative document size {size}")))?,
        storage_ref: row.try_get("storage_ref").map_err(database_error)?,
        provider_document_id: row.try_get("provider_document_id").map_err(database_error)?,
        uploaded_at: row.try_get("uploaded_at").map_err(database_error)?,
    })
}
