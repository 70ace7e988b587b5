use anyhow::{Context, Result};
use sqlx::PgConnection;
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64;

use crate::store::models::Platform;

/// 文字起こしジョブの冪等キー。コンテンツIDから導出するため、再投入しても同じジョブに解決される。
///
/// `attempt` はジョブ自体が失敗して新しいジョブを起こす場合にのみ増える。
pub(crate) fn transcription_idempotency_key(content_id: Uuid, attempt: u32) -> String {
    if attempt == 0 {
        format!("transcribe:{content_id}")
    } else {
        format!("transcribe:{content_id}:{attempt}")
    }
}

/// (content_id, platform) をPostgreSQLのアドバイザリロック用の64ビットキーに変換する。
pub(crate) fn version_lock_key(content_id: Uuid, platform: Platform) -> i64 {
    let mut material = Vec::with_capacity(16 + platform.as_str().len());
    material.extend_from_slice(content_id.as_bytes());
    material.extend_from_slice(platform.as_str().as_bytes());

    i64::from_be_bytes(xxh3_64(&material).to_be_bytes())
}

/// バージョン採番用のトランザクションスコープのアドバイザリロックを取得する。
///
/// `pg_advisory_xact_lock` はロックが解放されるまで待機し、トランザクション終了時に自動で解放される。
///
/// # Errors
/// SQLクエリの実行に失敗した場合はエラーを返します。
pub(crate) async fn acquire_version_lock(
    conn: &mut PgConnection,
    content_id: Uuid,
    platform: Platform,
) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(version_lock_key(content_id, platform))
        .execute(conn)
        .await
        .context("failed to execute pg_advisory_xact_lock")?;

    Ok(())
}
