use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("No user found with this email")]
    UserNotFound,

    #[error("You cannot add yourself")]
    CannotAddSelf,

    #[error("Friend already added")]
    AlreadyFriend,

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Expense not found: {0}")]
    ExpenseNotFound(String),

    #[error("Invalid expense: {0}")]
    InvalidExpense(String),

    #[error("Invalid settlement: {0}")]
    InvalidSettlement(String),

    #[error("Not signed in")]
    NotSignedIn,

    #[error("Filter accepts at most {limit} values, got {actual}")]
    FilterTooLarge { limit: usize, actual: usize },

    #[error("Database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("Store error: {0}")]
    Store(String),
}

impl LedgerError {
    /// Errors caused by the caller's input, safe to show to the user as-is.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            LedgerError::UserNotFound
                | LedgerError::CannotAddSelf
                | LedgerError::AlreadyFriend
                | LedgerError::InvalidExpense(_)
                | LedgerError::InvalidSettlement(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LedgerError::GroupNotFound(_) | LedgerError::ExpenseNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_messages_are_user_facing() {
        assert_eq!(LedgerError::CannotAddSelf.to_string(), "You cannot add yourself");
        assert_eq!(LedgerError::AlreadyFriend.to_string(), "Friend already added");
        assert!(LedgerError::UserNotFound.is_validation());
        assert!(!LedgerError::Store("offline".into()).is_validation());
        assert!(LedgerError::GroupNotFound("g1".into()).is_not_found());
    }
}
