mod client;
mod oauth;

pub use client::{ApiErrorClass, Download, DriveClient, DriveError, DriveFile, FileList};
pub use oauth::{ClientSecret, DRIVE_SCOPE, OAuthClient, OAuthError, OAuthToken};
