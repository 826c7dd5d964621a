//! RPC Client
//!
//! Blocking library client over the daemon socket, used by `wardenctl`
//! and by test code. One request in flight per connection.

use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::error::{Error, ErrorKind};
use crate::rpc::{read_frame, write_frame, BatchEntry, Request, Response};

pub struct WardenClient {
    stream: UnixStream,
}

impl WardenClient {
    pub fn connect(socket_path: &Path) -> Result<WardenClient, Error> {
        let stream = UnixStream::connect(socket_path)
            .map_err(|e| Error::new(ErrorKind::Unknown, format!("connect: {}", e)))?;
        Ok(WardenClient { stream })
    }

    /// Send one request and wait for its response frame.
    pub fn call(&mut self, request: &Request) -> Result<Response, Error> {
        write_frame(&mut self.stream, request)?;
        read_frame(&mut self.stream)?
            .ok_or_else(|| Error::new(ErrorKind::Unknown, "daemon closed the connection"))
    }

    /// Like [`call`](Self::call) but turns response error codes into `Err`.
    pub fn expect_ok(&mut self, request: &Request) -> Result<Response, Error> {
        let response = self.call(request)?;
        if response.error != 0 {
            return Err(Error::new(
                ErrorKind::from_code(response.error),
                response.error_message.unwrap_or_default(),
            ));
        }
        Ok(response)
    }

    pub fn create(&mut self, name: &str) -> Result<(), Error> {
        self.expect_ok(&Request::Create { name: name.into() })?;
        Ok(())
    }

    pub fn destroy(&mut self, name: &str) -> Result<(), Error> {
        self.expect_ok(&Request::Destroy { name: name.into() })?;
        Ok(())
    }

    pub fn start(&mut self, name: &str) -> Result<(), Error> {
        self.expect_ok(&Request::Start { name: name.into() })?;
        Ok(())
    }

    pub fn stop(&mut self, name: &str) -> Result<(), Error> {
        self.expect_ok(&Request::Stop { name: name.into() })?;
        Ok(())
    }

    pub fn pause(&mut self, name: &str) -> Result<(), Error> {
        self.expect_ok(&Request::Pause { name: name.into() })?;
        Ok(())
    }

    pub fn resume(&mut self, name: &str) -> Result<(), Error> {
        self.expect_ok(&Request::Resume { name: name.into() })?;
        Ok(())
    }

    pub fn kill(&mut self, name: &str, signal: i32) -> Result<(), Error> {
        self.expect_ok(&Request::Kill {
            name: name.into(),
            signal,
        })?;
        Ok(())
    }

    pub fn list(&mut self, filter: Option<&str>) -> Result<Vec<String>, Error> {
        let response = self.expect_ok(&Request::List {
            filter: filter.map(String::from),
        })?;
        Ok(response.list.unwrap_or_default())
    }

    pub fn property_list(&mut self) -> Result<Vec<(String, String)>, Error> {
        let response = self.expect_ok(&Request::PropertyList)?;
        Ok(response.described.unwrap_or_default())
    }

    pub fn data_list(&mut self) -> Result<Vec<(String, String)>, Error> {
        let response = self.expect_ok(&Request::DataList)?;
        Ok(response.described.unwrap_or_default())
    }

    pub fn get_property(&mut self, name: &str, property: &str) -> Result<String, Error> {
        let response = self.expect_ok(&Request::GetProperty {
            name: name.into(),
            property: property.into(),
        })?;
        Ok(response.value.unwrap_or_default())
    }

    pub fn set_property(&mut self, name: &str, property: &str, value: &str) -> Result<(), Error> {
        self.expect_ok(&Request::SetProperty {
            name: name.into(),
            property: property.into(),
            value: value.into(),
        })?;
        Ok(())
    }

    pub fn get_data(&mut self, name: &str, data: &str) -> Result<String, Error> {
        let response = self.expect_ok(&Request::GetData {
            name: name.into(),
            data: data.into(),
        })?;
        Ok(response.value.unwrap_or_default())
    }

    pub fn get(
        &mut self,
        names: &[&str],
        variables: &[&str],
    ) -> Result<Vec<BatchEntry>, Error> {
        let response = self.expect_ok(&Request::Get {
            names: names.iter().map(|s| s.to_string()).collect(),
            variables: variables.iter().map(|s| s.to_string()).collect(),
        })?;
        Ok(response.batch.unwrap_or_default())
    }

    /// Block until one of `names` dies or the timeout passes; `Ok(None)`
    /// is a timeout.
    pub fn wait(&mut self, names: &[&str], timeout_ms: i64) -> Result<Option<String>, Error> {
        let response = self.expect_ok(&Request::Wait {
            names: names.iter().map(|s| s.to_string()).collect(),
            timeout_ms,
        })?;
        Ok(response.name.filter(|n| !n.is_empty()))
    }

    pub fn version(&mut self) -> Result<String, Error> {
        let response = self.expect_ok(&Request::Version)?;
        Ok(response.value.unwrap_or_default())
    }
}
