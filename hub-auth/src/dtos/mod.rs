pub mod auth;

pub use auth::{
    ChangePasswordRequest, ClientContext, LoginRequest, LoginResponse, PasswordResetConfirm,
    PasswordResetRequest, RegisterRequest, RegisterResponse,
};
