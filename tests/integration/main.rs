// Single integration test target; each module covers one area.

mod common;
mod connection_test;
mod pub_sub_test;
mod req_res_test;
mod send_recv_test;
