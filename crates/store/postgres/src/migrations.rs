use sqlx::PgPool;
use tracing::info;

use crate::config::PostgresConfig;

/// Create every table and index the store needs, if missing.
///
/// Safe to run on every start.
///
/// # Errors
///
/// Returns a [`sqlx::Error`] if any DDL statement fails.
pub async fn run_migrations(pool: &PgPool, config: &PostgresConfig) -> Result<(), sqlx::Error> {
    let prefix = &config.table_prefix;
    let rows = config.rows_table();
    let change_log = config.change_log_table();
    let usage_events = config.usage_events_table();
    let rollup_ledger = config.rollup_ledger_table();
    let usage_daily = config.usage_daily_table();
    let period_ledger = config.period_ledger_table();
    let usage_periods = config.usage_periods_table();
    let overages = config.overages_table();
    let tenants = config.tenants_table();
    let plans = config.plans_table();
    let plan_features = config.plan_features_table();
    let subscriptions = config.subscriptions_table();
    let quota_usage = config.quota_usage_table();
    let locks = config.locks_table();

    let statements = [
        format!(
            "CREATE TABLE IF NOT EXISTS {rows} (
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                tenant_id UUID,
                natural_key TEXT,
                body JSONB NOT NULL,
                deleted BOOLEAN NOT NULL DEFAULT FALSE,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (kind, id)
            )"
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {prefix}rows_natural_key_idx \
             ON {rows} (kind, natural_key) WHERE natural_key IS NOT NULL"
        ),
        format!("CREATE INDEX IF NOT EXISTS {prefix}rows_tenant_idx ON {rows} (kind, tenant_id)"),
        format!(
            "CREATE TABLE IF NOT EXISTS {change_log} (
                seq BIGSERIAL PRIMARY KEY,
                id UUID NOT NULL UNIQUE,
                tenant_id UUID,
                entity_kind TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                old_values JSONB,
                new_values JSONB,
                actor TEXT NOT NULL,
                at TIMESTAMPTZ NOT NULL
            )"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {prefix}change_log_tenant_idx ON {change_log} (tenant_id, seq)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {usage_events} (
                id UUID PRIMARY KEY,
                tenant_id UUID NOT NULL,
                key TEXT NOT NULL,
                quantity NUMERIC(24, 6) NOT NULL,
                occurred_at TIMESTAMPTZ NOT NULL,
                source TEXT NOT NULL,
                idempotency_key TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (tenant_id, key, idempotency_key)
            )"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {prefix}usage_events_occurred_idx ON {usage_events} (occurred_at)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {rollup_ledger} (
                event_id UUID PRIMARY KEY,
                rolled_up_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {usage_daily} (
                tenant_id UUID NOT NULL,
                key TEXT NOT NULL,
                day DATE NOT NULL,
                quantity NUMERIC(24, 6) NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (tenant_id, key, day)
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {period_ledger} (
                tenant_id UUID NOT NULL,
                key TEXT NOT NULL,
                day DATE NOT NULL,
                folded_quantity NUMERIC(24, 6) NOT NULL,
                PRIMARY KEY (tenant_id, key, day)
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {usage_periods} (
                tenant_id UUID NOT NULL,
                key TEXT NOT NULL,
                period_start DATE NOT NULL,
                period_end DATE NOT NULL,
                quantity NUMERIC(24, 6) NOT NULL,
                closed BOOLEAN NOT NULL DEFAULT FALSE,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (tenant_id, key, period_start, period_end)
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {overages} (
                id UUID PRIMARY KEY,
                tenant_id UUID NOT NULL,
                subscription_id UUID NOT NULL,
                feature_key TEXT NOT NULL,
                period_start DATE NOT NULL,
                period_end DATE NOT NULL,
                quantity_used NUMERIC(24, 6) NOT NULL,
                quantity_over NUMERIC(24, 6) NOT NULL,
                unit_price NUMERIC(24, 6) NOT NULL,
                amount NUMERIC(24, 6) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (tenant_id, feature_key, period_start, period_end)
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {tenants} (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                active BOOLEAN NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {plans} (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                active BOOLEAN NOT NULL
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {plan_features} (
                plan_id UUID NOT NULL REFERENCES {plans} (id),
                feature_key TEXT NOT NULL,
                limit_value BIGINT NOT NULL,
                overage_price NUMERIC(24, 6),
                PRIMARY KEY (plan_id, feature_key)
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {subscriptions} (
                id UUID PRIMARY KEY,
                tenant_id UUID NOT NULL,
                plan_id UUID NOT NULL REFERENCES {plans} (id),
                status TEXT NOT NULL,
                billing_period_start DATE NOT NULL,
                billing_period_end DATE NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {prefix}subscriptions_tenant_idx \
             ON {subscriptions} (tenant_id, status, created_at DESC)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {quota_usage} (
                tenant_id UUID NOT NULL,
                feature_key TEXT NOT NULL,
                period_start DATE NOT NULL,
                period_end DATE NOT NULL,
                usage BIGINT NOT NULL,
                PRIMARY KEY (tenant_id, feature_key, period_start)
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {locks} (
                name TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )"
        ),
    ];

    for statement in &statements {
        sqlx::query(statement).execute(pool).await?;
    }
    info!(schema = %config.schema, prefix = %prefix, "database migrations applied");
    Ok(())
}
