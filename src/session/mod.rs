pub mod send_socket;
pub mod send_buffer;
pub mod kcp_session;
