use async_trait::async_trait;
use tracing::{debug, instrument};

use merlin_core::errors::RepositoryError;
use merlin_core::ids::{SessionId, SessionKey};
use merlin_core::prompt::Role;
use merlin_core::repository::{CommittedTurn, TurnContext, TurnRepository, UnitOfWork};
use merlin_core::stream::Usage;

use crate::database::Database;
use crate::error::StoreError;
use crate::messages::{self, NewMessage};
use crate::sessions;

/// [`TurnRepository`] backed by the SQLite store.
#[derive(Clone)]
pub struct SqliteTurnRepository {
    db: Database,
}

impl SqliteTurnRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TurnRepository for SqliteTurnRepository {
    #[instrument(skip(self), fields(session_id = %key.session_id))]
    async fn load_context(
        &self,
        key: &SessionKey,
        history_limit: usize,
    ) -> Result<TurnContext, RepositoryError> {
        let context = self.db.with_conn(|conn| {
            let session = sessions::get_owned(conn, &key.user_id, &key.session_id)?;
            let history = messages::list(conn, &key.session_id, None, history_limit)?;
            Ok(TurnContext {
                session: session.snapshot(),
                history,
            })
        })?;
        Ok(context)
    }

    #[instrument(skip(self), fields(session_id = %key.session_id))]
    async fn begin(&self, key: &SessionKey) -> Result<Box<dyn UnitOfWork>, RepositoryError> {
        let session = self
            .db
            .with_conn(|conn| sessions::get_owned(conn, &key.user_id, &key.session_id))?;
        if session.is_archived() {
            return Err(StoreError::Forbidden(format!("session {} is archived", key.session_id)).into());
        }
        Ok(Box::new(SqliteUnitOfWork {
            db: self.db.clone(),
            session_id: key.session_id.clone(),
            staged: Vec::new(),
        }))
    }
}

struct StagedMessage {
    role: Role,
    content: String,
    client_message_id: Option<String>,
    usage: Option<Usage>,
}

/// Buffers a turn's rows in memory and writes them in one transaction.
struct SqliteUnitOfWork {
    db: Database,
    session_id: SessionId,
    staged: Vec<StagedMessage>,
}

#[async_trait]
impl UnitOfWork for SqliteUnitOfWork {
    async fn append_user_turn(
        &mut self,
        content: &str,
        client_message_id: Option<&str>,
    ) -> Result<(), RepositoryError> {
        self.staged.push(StagedMessage {
            role: Role::User,
            content: content.to_owned(),
            client_message_id: client_message_id.map(str::to_owned),
            usage: None,
        });
        Ok(())
    }

    async fn append_assistant_turn(
        &mut self,
        content: &str,
        usage: &Usage,
    ) -> Result<(), RepositoryError> {
        self.staged.push(StagedMessage {
            role: Role::Assistant,
            content: content.to_owned(),
            client_message_id: None,
            usage: Some(*usage),
        });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<CommittedTurn, RepositoryError> {
        let committed = self.db.with_tx(|tx| {
            let mut committed = CommittedTurn::default();
            for staged in &self.staged {
                let stored = messages::insert(
                    tx,
                    &self.session_id,
                    &NewMessage {
                        role: staged.role,
                        content: &staged.content,
                        client_message_id: staged.client_message_id.as_deref(),
                        usage: staged.usage,
                    },
                )?;
                match staged.role {
                    Role::Assistant => committed.assistant_message_id = Some(stored.id),
                    _ => committed.user_message_id = Some(stored.id),
                }
            }
            sessions::touch(tx, &self.session_id)?;
            Ok(committed)
        })?;
        debug!(
            session_id = %self.session_id,
            rows = self.staged.len(),
            "turn committed"
        );
        Ok(committed)
    }

    async fn rollback(self: Box<Self>) -> Result<(), RepositoryError> {
        debug!(
            session_id = %self.session_id,
            discarded = self.staged.len(),
            "turn rolled back"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessageRepo;
    use crate::sessions::{NewSession, SessionRepo};
    use merlin_core::ids::{CharacterId, UserId};

    struct Fixture {
        db: Database,
        repo: SqliteTurnRepository,
        key: SessionKey,
    }

    fn setup() -> Fixture {
        let db = Database::in_memory().unwrap();
        let user_id = UserId::from_raw("user_1");
        let (row, _) = SessionRepo::new(db.clone())
            .get_or_create_active(
                &user_id,
                &CharacterId::from_raw("char_1"),
                &NewSession {
                    title: "The Sunken Keep".into(),
                    location: Some("Gatehouse".into()),
                    ..NewSession::default()
                },
            )
            .unwrap();
        Fixture {
            repo: SqliteTurnRepository::new(db.clone()),
            key: SessionKey::new(user_id, row.session_id),
            db,
        }
    }

    fn messages(f: &Fixture) -> MessageRepo {
        MessageRepo::new(f.db.clone())
    }

    #[tokio::test]
    async fn commit_writes_both_rows() {
        let f = setup();
        let mut uow = f.repo.begin(&f.key).await.unwrap();
        uow.append_user_turn("I open the door.", Some("c-1"))
            .await
            .unwrap();
        uow.append_assistant_turn("It creaks open.", &Usage::new(30, 5))
            .await
            .unwrap();
        let committed = uow.commit().await.unwrap();

        let user_id = committed.user_message_id.unwrap();
        let assistant_id = committed.assistant_message_id.unwrap();
        assert!(user_id < assistant_id);

        let stored = messages(&f).list(&f.key.session_id, None, 10).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].role, Role::User);
        assert_eq!(stored[1].content, "It creaks open.");
    }

    #[tokio::test]
    async fn nothing_visible_before_commit() {
        let f = setup();
        let mut uow = f.repo.begin(&f.key).await.unwrap();
        uow.append_user_turn("hello", None).await.unwrap();
        assert_eq!(messages(&f).count(&f.key.session_id).unwrap(), 0);
        uow.commit().await.unwrap();
        assert_eq!(messages(&f).count(&f.key.session_id).unwrap(), 1);
    }

    #[tokio::test]
    async fn rollback_discards_staged_rows() {
        let f = setup();
        let mut uow = f.repo.begin(&f.key).await.unwrap();
        uow.append_user_turn("never mind", None).await.unwrap();
        uow.rollback().await.unwrap();
        assert_eq!(messages(&f).count(&f.key.session_id).unwrap(), 0);
    }

    #[tokio::test]
    async fn begin_rejects_foreign_session() {
        let f = setup();
        let stranger = SessionKey::new(UserId::from_raw("user_2"), f.key.session_id.clone());
        let result = f.repo.begin(&stranger).await;
        assert!(matches!(result, Err(RepositoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn begin_rejects_archived_session() {
        let f = setup();
        SessionRepo::new(f.db.clone())
            .archive(&f.key.user_id, &f.key.session_id)
            .unwrap();
        let result = f.repo.begin(&f.key).await;
        assert!(matches!(result, Err(RepositoryError::Forbidden(_))));
    }

    #[tokio::test]
    async fn failed_commit_leaves_no_rows() {
        let f = setup();
        let mut uow = f.repo.begin(&f.key).await.unwrap();
        uow.append_user_turn("hello", None).await.unwrap();
        uow.append_assistant_turn("hi", &Usage::default())
            .await
            .unwrap();
        // Removing the session makes the inserts violate the foreign key.
        f.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM chat_sessions WHERE session_id = ?1",
                [f.key.session_id.as_str()],
            )?;
            Ok(())
        })
        .unwrap();

        let result = uow.commit().await;
        assert!(matches!(result, Err(RepositoryError::Storage(_))));
        assert_eq!(messages(&f).count(&f.key.session_id).unwrap(), 0);
    }

    #[tokio::test]
    async fn load_context_returns_snapshot_and_recent_history() {
        let f = setup();
        for i in 0..4 {
            let mut uow = f.repo.begin(&f.key).await.unwrap();
            uow.append_user_turn(&format!("move {i}"), None)
                .await
                .unwrap();
            uow.append_assistant_turn(&format!("reply {i}"), &Usage::default())
                .await
                .unwrap();
            uow.commit().await.unwrap();
        }

        let context = f.repo.load_context(&f.key, 3).await.unwrap();
        assert_eq!(context.session.title, "The Sunken Keep");
        assert_eq!(context.session.location.as_deref(), Some("Gatehouse"));
        let contents: Vec<&str> = context.history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["reply 2", "move 3", "reply 3"]);
    }

    #[tokio::test]
    async fn load_context_of_missing_session_is_not_found() {
        let f = setup();
        let key = SessionKey::new(f.key.user_id.clone(), SessionId::from_raw("sess_missing"));
        let result = f.repo.load_context(&key, 10).await;
        assert!(matches!(result, Err(RepositoryError::NotFound(_))));
    }
}
