pub mod password;
pub mod tokens;

pub use password::{hash_password, verify_password, Password, PasswordHashString};
pub use tokens::{generate_backup_code, generate_numeric_code, generate_random_token};
